// src/model.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::store::{AttrValue, Item, ItemKey};

/// Sort-key sentinel of the show record within its partition.
pub const SHOW_SORT_KEY: &str = "SHOW";

/// Sort-key prefix of ticket records. Sorts after [`SHOW_SORT_KEY`], so a
/// prefix scan selects all tickets and never the show record.
pub const TICKET_SORT_KEY_PREFIX: &str = "TICKET#";

/// Secondary index re-keying the partition on the reservation reference.
pub const TICKET_REF_INDEX: &str = "ticket-ref-index";

/// Derive the range key of a ticket within its show partition.
pub fn ticket_sort_key(ticket_id: &str) -> String {
    format!("{}{}", TICKET_SORT_KEY_PREFIX, ticket_id)
}

/// Seating category of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeatArea {
    Balcony,
    Stalls,
    Circle,
}

impl SeatArea {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeatArea::Balcony => "BALCONY",
            SeatArea::Stalls => "STALLS",
            SeatArea::Circle => "CIRCLE",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "BALCONY" => Ok(SeatArea::Balcony),
            "STALLS" => Ok(SeatArea::Stalls),
            "CIRCLE" => Ok(SeatArea::Circle),
            other => Err(Error::Deserialize(format!("unknown seat area: {}", other))),
        }
    }
}

/// Reservation state of a ticket.
/// The only transitions are Available → Reserved (conditional write) and
/// Reserved → Available (release); neither state is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    Available,
    Reserved,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TicketStatus::Available => "AVAILABLE",
            TicketStatus::Reserved => "RESERVED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "AVAILABLE" => Ok(TicketStatus::Available),
            "RESERVED" => Ok(TicketStatus::Reserved),
            other => Err(Error::Deserialize(format!(
                "unknown ticket status: {}",
                other
            ))),
        }
    }
}

/// A scheduled performance. Created once, display-only afterwards; the
/// reservation core never mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Show {
    pub show_id: String,
    pub name: String,
    pub venue: String,
    pub duration_minutes: i64,
    pub date_time: DateTime<Utc>,
}

impl Show {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.show_id.clone(), SHOW_SORT_KEY)
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert("showId".to_string(), AttrValue::from(self.show_id.clone()));
        item.insert("sortKey".to_string(), AttrValue::from(SHOW_SORT_KEY));
        item.insert("name".to_string(), AttrValue::from(self.name.clone()));
        item.insert("venue".to_string(), AttrValue::from(self.venue.clone()));
        item.insert(
            "durationMinutes".to_string(),
            AttrValue::Int(self.duration_minutes),
        );
        item.insert("dateTime".to_string(), AttrValue::Timestamp(self.date_time));
        item
    }

    /// Decode a show record. Every attribute must be declared below;
    /// unknown attributes are an error, never silently dropped.
    pub fn from_item(item: &Item) -> Result<Self, Error> {
        let mut show_id = None;
        let mut name = None;
        let mut venue = None;
        let mut duration_minutes = None;
        let mut date_time = None;

        for (attr, value) in item {
            match attr.as_str() {
                "showId" => show_id = value.as_str().map(str::to_string),
                "sortKey" => {
                    if value.as_str() != Some(SHOW_SORT_KEY) {
                        return Err(Error::Deserialize(format!(
                            "not a show record: sort key {:?}",
                            value
                        )));
                    }
                }
                "name" => name = value.as_str().map(str::to_string),
                "venue" => venue = value.as_str().map(str::to_string),
                "durationMinutes" => duration_minutes = value.as_int(),
                "dateTime" => date_time = value.as_timestamp(),
                other => {
                    return Err(Error::Deserialize(format!(
                        "unknown show attribute: {}",
                        other
                    )));
                }
            }
        }

        Ok(Show {
            show_id: show_id
                .ok_or_else(|| Error::Deserialize("show record missing showId".to_string()))?,
            name: name
                .ok_or_else(|| Error::Deserialize("show record missing name".to_string()))?,
            venue: venue
                .ok_or_else(|| Error::Deserialize("show record missing venue".to_string()))?,
            duration_minutes: duration_minutes.ok_or_else(|| {
                Error::Deserialize("show record missing durationMinutes".to_string())
            })?,
            date_time: date_time
                .ok_or_else(|| Error::Deserialize("show record missing dateTime".to_string()))?,
        })
    }
}

/// One unit of reservable inventory, belonging to exactly one show.
///
/// Invariant: `reference.is_some()` iff `status == Reserved`. The decoder
/// rejects records violating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub show_id: String,
    pub ticket_id: String,
    pub area: SeatArea,
    pub price: f64,
    pub status: TicketStatus,
    pub reference: Option<String>,
}

impl Ticket {
    /// A fresh, reservable ticket.
    pub fn available(
        show_id: impl Into<String>,
        ticket_id: impl Into<String>,
        area: SeatArea,
        price: f64,
    ) -> Self {
        Self {
            show_id: show_id.into(),
            ticket_id: ticket_id.into(),
            area,
            price,
            status: TicketStatus::Available,
            reference: None,
        }
    }

    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.show_id.clone(), ticket_sort_key(&self.ticket_id))
    }

    pub fn is_reservable(&self) -> bool {
        self.status == TicketStatus::Available
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert("showId".to_string(), AttrValue::from(self.show_id.clone()));
        item.insert(
            "sortKey".to_string(),
            AttrValue::from(ticket_sort_key(&self.ticket_id)),
        );
        item.insert("area".to_string(), AttrValue::from(self.area.as_str()));
        item.insert("price".to_string(), AttrValue::Float(self.price));
        item.insert("status".to_string(), AttrValue::from(self.status.as_str()));
        if let Some(reference) = &self.reference {
            item.insert("ticketRef".to_string(), AttrValue::from(reference.clone()));
        }
        item
    }

    /// Decode a ticket record, enforcing the status/reference invariant.
    pub fn from_item(item: &Item) -> Result<Self, Error> {
        let mut show_id = None;
        let mut ticket_id = None;
        let mut area = None;
        let mut price = None;
        let mut status = None;
        let mut reference = None;

        for (attr, value) in item {
            match attr.as_str() {
                "showId" => show_id = value.as_str().map(str::to_string),
                "sortKey" => match value.as_str() {
                    Some(sort) => match sort.strip_prefix(TICKET_SORT_KEY_PREFIX) {
                        Some(id) => ticket_id = Some(id.to_string()),
                        None => {
                            return Err(Error::Deserialize(format!(
                                "not a ticket record: sort key {}",
                                sort
                            )));
                        }
                    },
                    None => {
                        return Err(Error::Deserialize(
                            "ticket sort key is not a string".to_string(),
                        ));
                    }
                },
                "area" => {
                    area = Some(SeatArea::parse(value.as_str().ok_or_else(|| {
                        Error::Deserialize("ticket area is not a string".to_string())
                    })?)?);
                }
                "price" => price = value.as_float(),
                "status" => {
                    status = Some(TicketStatus::parse(value.as_str().ok_or_else(|| {
                        Error::Deserialize("ticket status is not a string".to_string())
                    })?)?);
                }
                "ticketRef" => reference = value.as_str().map(str::to_string),
                other => {
                    return Err(Error::Deserialize(format!(
                        "unknown ticket attribute: {}",
                        other
                    )));
                }
            }
        }

        let ticket = Ticket {
            show_id: show_id
                .ok_or_else(|| Error::Deserialize("ticket record missing showId".to_string()))?,
            ticket_id: ticket_id
                .ok_or_else(|| Error::Deserialize("ticket record missing sortKey".to_string()))?,
            area: area
                .ok_or_else(|| Error::Deserialize("ticket record missing area".to_string()))?,
            price: price
                .ok_or_else(|| Error::Deserialize("ticket record missing price".to_string()))?,
            status: status
                .ok_or_else(|| Error::Deserialize("ticket record missing status".to_string()))?,
            reference,
        };

        match (ticket.status, &ticket.reference) {
            (TicketStatus::Reserved, None) => Err(Error::Deserialize(format!(
                "ticket {} is RESERVED without a reference",
                ticket.ticket_id
            ))),
            (TicketStatus::Available, Some(_)) => Err(Error::Deserialize(format!(
                "ticket {} is AVAILABLE but still referenced",
                ticket.ticket_id
            ))),
            _ => Ok(ticket),
        }
    }
}
