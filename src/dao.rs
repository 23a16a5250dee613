// src/dao.rs
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::debug;

use crate::error::Error;
use crate::model::{
    SHOW_SORT_KEY, Show, TICKET_REF_INDEX, TICKET_SORT_KEY_PREFIX, Ticket, TicketStatus,
    ticket_sort_key,
};
use crate::page::QueryResultPage;
use crate::store::{
    AttrValue, Condition, IndexDef, Item, ItemKey, ItemStore, KeySchema, Query, TransactUpdate,
    UpdateExpr,
};

/// Typed operations on the theatre table: one partition per show, the
/// show record under the `"SHOW"` sentinel and tickets under `"TICKET#"`
/// sort keys. Holds an explicitly injected store handle; there is no
/// ambient client.
pub struct ShowTicketDao {
    store: Arc<dyn ItemStore>,
}

impl ShowTicketDao {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    /// Key layout of the theatre table, for store construction.
    pub fn key_schema() -> KeySchema {
        KeySchema::new("showId", "sortKey")
    }

    /// The reservation-reference index, for store construction.
    pub fn reference_index() -> IndexDef {
        IndexDef::new(TICKET_REF_INDEX, "ticketRef")
    }

    fn ticket_key(show_id: &str, ticket_id: &str) -> ItemKey {
        ItemKey::new(show_id, ticket_sort_key(ticket_id))
    }

    // ==================== Writes ====================

    pub async fn save_show(&self, show: &Show) -> Result<(), Error> {
        self.store.put(show.key(), show.to_item(), None).await
    }

    pub async fn save_ticket(&self, ticket: &Ticket) -> Result<(), Error> {
        self.store.put(ticket.key(), ticket.to_item(), None).await
    }

    /// Administrative removal; not part of the reservation lifecycle.
    pub async fn delete_ticket(&self, show_id: &str, ticket_id: &str) -> Result<(), Error> {
        self.store
            .delete(&Self::ticket_key(show_id, ticket_id))
            .await
    }

    // ==================== Reservation writes ====================

    /// Conditionally flip one ticket to RESERVED, stamping the given
    /// reference. Losing the race, or naming a ticket that does not
    /// exist, surfaces as `ReservationConflict`; the two cases are not
    /// distinguished and the write is never retried.
    pub async fn reserve_ticket(
        &self,
        show_id: &str,
        ticket_id: &str,
        reference: &str,
    ) -> Result<(), Error> {
        debug!(show_id, ticket_id, "reserving ticket");
        let result = self
            .store
            .update(
                &Self::ticket_key(show_id, ticket_id),
                UpdateExpr::new()
                    .set("status", TicketStatus::Reserved.as_str())
                    .set("ticketRef", reference),
                Some(Condition::equals(
                    "status",
                    TicketStatus::Available.as_str(),
                )),
            )
            .await;

        match result {
            Err(Error::PreconditionFailed) => Err(Error::ReservationConflict),
            other => other,
        }
    }

    /// Reserve a set of tickets in one all-or-nothing write, stamping the
    /// caller-supplied reference on every one. Ticket ids are taken in
    /// sorted order so a retried request fingerprints identically for the
    /// idempotency token.
    pub async fn reserve_tickets(
        &self,
        show_id: &str,
        ticket_ids: &std::collections::BTreeSet<String>,
        reference: &str,
        token: Option<&str>,
    ) -> Result<(), Error> {
        debug!(show_id, count = ticket_ids.len(), "reserving ticket batch");
        let ops = ticket_ids
            .iter()
            .map(|ticket_id| TransactUpdate {
                key: Self::ticket_key(show_id, ticket_id),
                update: UpdateExpr::new()
                    .set("status", TicketStatus::Reserved.as_str())
                    .set("ticketRef", reference),
                condition: Some(Condition::equals(
                    "status",
                    TicketStatus::Available.as_str(),
                )),
            })
            .collect();

        self.store.transact_update(ops, token).await
    }

    /// Return a ticket to AVAILABLE, clearing its reference. Idempotent:
    /// releasing an already-available or missing ticket is a no-op.
    pub async fn release_ticket(&self, show_id: &str, ticket_id: &str) -> Result<(), Error> {
        let result = self
            .store
            .update(
                &Self::ticket_key(show_id, ticket_id),
                UpdateExpr::new()
                    .set("status", TicketStatus::Available.as_str())
                    .remove("ticketRef"),
                Some(Condition::Exists),
            )
            .await;

        match result {
            Err(Error::PreconditionFailed) => Ok(()),
            other => other,
        }
    }

    // ==================== Reads ====================

    pub async fn find_show_by_id(&self, show_id: &str) -> Result<Option<Show>, Error> {
        let key = ItemKey::new(show_id, SHOW_SORT_KEY);
        match self.store.get(&key).await? {
            Some(item) => Ok(Some(Show::from_item(&item)?)),
            None => Ok(None),
        }
    }

    pub async fn find_ticket_by_id(
        &self,
        show_id: &str,
        ticket_id: &str,
    ) -> Result<Option<Ticket>, Error> {
        match self.store.get(&Self::ticket_key(show_id, ticket_id)).await? {
            Some(item) => Ok(Some(Ticket::from_item(&item)?)),
            None => Ok(None),
        }
    }

    /// Reverse lookup through the reference index. Empty once the ticket
    /// has been released (the reference attribute is removed).
    pub async fn find_ticket_by_reference(
        &self,
        show_id: &str,
        reference: &str,
    ) -> Result<Option<Ticket>, Error> {
        let items = self
            .store
            .query_index(TICKET_REF_INDEX, show_id, &AttrValue::from(reference))
            .await?;

        match items.first() {
            Some(item) => Ok(Some(Ticket::from_item(item)?)),
            None => Ok(None),
        }
    }

    /// All tickets of a show, optionally narrowed to one status by a
    /// store-level filter.
    pub async fn find_tickets(
        &self,
        show_id: &str,
        status: Option<TicketStatus>,
    ) -> Result<Vec<Ticket>, Error> {
        let mut query = Query::partition(show_id).sort_prefix(TICKET_SORT_KEY_PREFIX);
        if let Some(status) = status {
            query = query.filter("status", status.as_str());
        }

        self.query_all(query)
            .await?
            .iter()
            .map(Ticket::from_item)
            .collect()
    }

    /// One page of tickets, optionally narrowed to a status.
    ///
    /// The store caps the raw scan before applying the filter, so a
    /// single fetch may come back short; keep fetching until `page_size`
    /// matches accumulate or the scan is exhausted, then trim overshoot
    /// and re-derive the cursor from the last ticket actually returned.
    pub async fn find_tickets_paged(
        &self,
        show_id: &str,
        status: Option<TicketStatus>,
        page_size: usize,
        start_after: Option<&ItemKey>,
    ) -> Result<QueryResultPage<Ticket, ItemKey>, Error> {
        if page_size == 0 {
            return Err(Error::InvalidRequest("page size must be positive".to_string()));
        }

        let mut results = Vec::new();
        let mut cursor = start_after.cloned();
        let mut next_key;
        loop {
            let mut query = Query::partition(show_id)
                .sort_prefix(TICKET_SORT_KEY_PREFIX)
                .limit(page_size);
            if let Some(status) = status {
                query = query.filter("status", status.as_str());
            }
            if let Some(cursor) = &cursor {
                query = query.start_after(cursor.clone());
            }

            let page = self.store.query(query).await?;
            for item in &page.items {
                results.push(Ticket::from_item(item)?);
            }
            next_key = page.last_key;
            if results.len() >= page_size || next_key.is_none() {
                break;
            }
            cursor = next_key.clone();
        }

        if results.len() > page_size {
            results.truncate(page_size);
            if let Some(last) = results.last() {
                next_key = Some(last.key());
            }
        }

        Ok(QueryResultPage { results, next_key })
    }

    /// One range scan over the full partition, split locally into the
    /// show record and its tickets. An unknown show id yields
    /// `(None, vec![])`, not an error.
    pub async fn find_show_and_tickets(
        &self,
        show_id: &str,
    ) -> Result<(Option<Show>, Vec<Ticket>), Error> {
        let items = self.query_all(Query::partition(show_id)).await?;

        let mut show = None;
        let mut tickets = Vec::new();
        for item in &items {
            match item.get("sortKey").and_then(AttrValue::as_str) {
                Some(SHOW_SORT_KEY) => show = Some(Show::from_item(item)?),
                Some(sort) if sort.starts_with(TICKET_SORT_KEY_PREFIX) => {
                    tickets.push(Ticket::from_item(item)?);
                }
                _ => {}
            }
        }

        Ok((show, tickets))
    }

    /// Drain a range query across store pages.
    async fn query_all(&self, query: Query) -> Result<Vec<Item>, Error> {
        let start = Instant::now();
        let partition = query.partition.clone();

        let mut query = query;
        let mut items = Vec::new();
        loop {
            let page = self.store.query(query.clone()).await?;
            items.extend(page.items);
            match page.last_key {
                Some(key) => query.start_after = Some(key),
                None => break,
            }
        }

        histogram!("theatron.query.duration_ms", "table" => "theatre")
            .record(start.elapsed().as_millis() as f64);
        debug!(partition = %partition, items = items.len(), "partition query complete");
        Ok(items)
    }
}
