// src/lib.rs
//! # Theatron
//!
//! *θέατρον — Ancient Greek for "a place for viewing".*
//!
//! Theatron allocates scarce, uniquely-identified inventory (theatre
//! seats) to concurrent requesters over a partitioned key-value store,
//! guaranteeing that each seat is assigned to at most one successful
//! request and that client retries never double-charge or double-release
//! inventory.
//!
//! ## What's inside
//!
//! ### Conditional reservations
//! A single-seat reservation is one conditional write: flip the ticket
//! from AVAILABLE to RESERVED only if it is still AVAILABLE at the
//! store's commit point. Losing the race is a business outcome, surfaced
//! as a conflict and never retried internally.
//!
//! ### Atomic batches with idempotency tokens
//! Multi-seat requests go through one all-or-nothing transactional write.
//! An optional caller-supplied idempotency token makes retries after
//! network ambiguity safe: an identical resubmission replays the original
//! success, a token reused for a different seat set is rejected as a
//! client defect.
//!
//! ### Read path
//! Point reads, full show-with-tickets retrieval, seat-area grouping and
//! average-price aggregation, reverse lookup by reservation reference
//! through a secondary index, and cursor pagination that compensates for
//! the store applying its scan limit before filter predicates.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use theatron::{MemoryStore, ShowTicketDao, ShowTicketService};
//!
//! let store = Arc::new(
//!     MemoryStore::new(ShowTicketDao::key_schema())
//!         .with_index(ShowTicketDao::reference_index()),
//! );
//! let service = ShowTicketService::new(store);
//!
//! let reference = service.reserve_ticket("show-1", "A12").await?;
//! ```
//!
//! ## Store backends
//!
//! The store is an explicitly constructed, dependency-injected handle;
//! there is no ambient client. [`MemoryStore`] carries the full conditional-write,
//! transaction and idempotency semantics in process; [`PostgresStore`]
//! (feature `postgres`, default) persists the same contract through sqlx.
//!
//! ## Feature flags
//!
//! | Flag       | Default | Description                      |
//! |------------|---------|----------------------------------|
//! | `postgres` | ✓       | PostgreSQL store via sqlx        |

pub mod dao;
pub mod error;
pub mod model;
pub mod page;
pub mod service;
pub mod store;
pub mod trade;

pub use dao::ShowTicketDao;
pub use error::Error;
pub use model::{
    SHOW_SORT_KEY, SeatArea, Show, TICKET_REF_INDEX, TICKET_SORT_KEY_PREFIX, Ticket, TicketStatus,
    ticket_sort_key,
};
pub use page::QueryResultPage;
pub use service::ShowTicketService;
pub use store::{
    AttrValue, Condition, DEFAULT_IDEMPOTENCY_WINDOW, IndexDef, Item, ItemKey, ItemStore,
    KeySchema, MAX_TRANSACT_ITEMS, MemoryStore, Page, Query, TransactUpdate, UpdateExpr,
};
pub use trade::{
    StockTransaction, StockTransactionDao, StockTransactionKey, TradeAction, trade_sort_key,
};

#[cfg(feature = "postgres")]
pub use store::PostgresStore;
