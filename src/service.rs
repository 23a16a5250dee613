// src/service.rs
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use metrics::counter;
use tracing::warn;
use uuid::Uuid;

use crate::dao::ShowTicketDao;
use crate::error::Error;
use crate::model::{SeatArea, Show, Ticket, TicketStatus};
use crate::page::QueryResultPage;
use crate::store::{ItemKey, ItemStore};

/// Reservation engine and read-side facade over the theatre table.
///
/// Reservation outcomes are final: a conflict means the caller lost the
/// race and is never retried here. Retries belong to the caller, made
/// safe for the batch path by the idempotency token.
pub struct ShowTicketService {
    dao: ShowTicketDao,
}

impl ShowTicketService {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self {
            dao: ShowTicketDao::new(store),
        }
    }

    pub fn dao(&self) -> &ShowTicketDao {
        &self.dao
    }

    // ==================== Reservations ====================

    /// Reserve a single ticket, returning the freshly generated
    /// reservation reference on success.
    pub async fn reserve_ticket(&self, show_id: &str, ticket_id: &str) -> Result<String, Error> {
        let reference = Uuid::now_v7().to_string();
        let result = self.dao.reserve_ticket(show_id, ticket_id, &reference).await;

        counter!("theatron.reservations.total",
            "kind" => "single",
            "outcome" => if result.is_ok() { "reserved" } else { "conflict" }
        )
        .increment(1);

        match result {
            Ok(()) => Ok(reference),
            Err(err) => {
                warn!(show_id, ticket_id, %err, "ticket reservation failed");
                Err(err)
            }
        }
    }

    /// Reserve a set of tickets atomically under a caller-supplied
    /// reference. The reference is an input, not generated here, so a
    /// retry with the same idempotency token reproduces the identical
    /// operation set.
    pub async fn reserve_tickets(
        &self,
        show_id: &str,
        ticket_ids: &BTreeSet<String>,
        reference: &str,
        token: Option<&str>,
    ) -> Result<(), Error> {
        let result = self
            .dao
            .reserve_tickets(show_id, ticket_ids, reference, token)
            .await;

        counter!("theatron.reservations.total",
            "kind" => "batch",
            "outcome" => match &result {
                Ok(()) => "reserved",
                Err(Error::IdempotencyConflict) => "token_conflict",
                Err(_) => "conflict",
            }
        )
        .increment(1);

        if let Err(err) = &result {
            warn!(show_id, count = ticket_ids.len(), %err, "batch reservation failed");
        }
        result
    }

    /// Release a ticket back to the available pool. Idempotent.
    pub async fn release_ticket(&self, show_id: &str, ticket_id: &str) -> Result<(), Error> {
        self.dao.release_ticket(show_id, ticket_id).await
    }

    // ==================== Queries ====================

    pub async fn find_show(&self, show_id: &str) -> Result<Option<Show>, Error> {
        self.dao.find_show_by_id(show_id).await
    }

    pub async fn find_ticket(
        &self,
        show_id: &str,
        ticket_id: &str,
    ) -> Result<Option<Ticket>, Error> {
        self.dao.find_ticket_by_id(show_id, ticket_id).await
    }

    pub async fn find_ticket_by_reference(
        &self,
        show_id: &str,
        reference: &str,
    ) -> Result<Option<Ticket>, Error> {
        self.dao.find_ticket_by_reference(show_id, reference).await
    }

    pub async fn find_show_and_tickets(
        &self,
        show_id: &str,
    ) -> Result<(Option<Show>, Vec<Ticket>), Error> {
        self.dao.find_show_and_tickets(show_id).await
    }

    /// Tickets of a show, optionally narrowed to one status.
    pub async fn find_tickets_by_status(
        &self,
        show_id: &str,
        status: Option<TicketStatus>,
    ) -> Result<Vec<Ticket>, Error> {
        self.dao.find_tickets(show_id, status).await
    }

    /// One cursor page of tickets, optionally narrowed to one status.
    pub async fn find_tickets_page(
        &self,
        show_id: &str,
        status: Option<TicketStatus>,
        page_size: usize,
        start_after: Option<&ItemKey>,
    ) -> Result<QueryResultPage<Ticket, ItemKey>, Error> {
        self.dao
            .find_tickets_paged(show_id, status, page_size, start_after)
            .await
    }

    pub async fn group_tickets_by_area(
        &self,
        show_id: &str,
    ) -> Result<HashMap<SeatArea, Vec<Ticket>>, Error> {
        let tickets = self.dao.find_tickets(show_id, None).await?;

        let mut grouped: HashMap<SeatArea, Vec<Ticket>> = HashMap::new();
        for ticket in tickets {
            grouped.entry(ticket.area).or_default().push(ticket);
        }
        Ok(grouped)
    }

    /// Mean ticket price per seat area. Areas with no tickets are absent
    /// from the result.
    pub async fn average_price_by_area(
        &self,
        show_id: &str,
    ) -> Result<HashMap<SeatArea, f64>, Error> {
        let tickets = self.dao.find_tickets(show_id, None).await?;

        let mut sums: HashMap<SeatArea, (f64, usize)> = HashMap::new();
        for ticket in &tickets {
            let entry = sums.entry(ticket.area).or_insert((0.0, 0));
            entry.0 += ticket.price;
            entry.1 += 1;
        }

        Ok(sums
            .into_iter()
            .map(|(area, (sum, count))| (area, sum / count as f64))
            .collect())
    }
}
