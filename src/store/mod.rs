// src/store/mod.rs
pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

/// Upper bound on the number of items in one atomic multi-item write,
/// matching the documented limit of the backing store.
pub const MAX_TRANSACT_ITEMS: usize = 25;

/// How long a committed idempotency token stays bound to its operation
/// set, matching the assumed managed-store default. Callers must not
/// rely on replay protection beyond this window.
pub const DEFAULT_IDEMPOTENCY_WINDOW: std::time::Duration =
    std::time::Duration::from_secs(600);

/// A single attribute value.
///
/// Variant order matters: `serde(untagged)` tries variants top to bottom,
/// so `Timestamp` must precede `String` for RFC 3339 values to survive a
/// JSON round trip, and `Int` must precede `Float` so whole numbers stay
/// integral.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    String(String),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            AttrValue::Float(f) => Some(*f),
            AttrValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttrValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

/// One stored record: attribute name to value, key attributes included.
pub type Item = BTreeMap<String, AttrValue>;

/// Primary key of an item: partition key plus sort key within the partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub partition: String,
    pub sort: String,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: sort.into(),
        }
    }
}

/// Names of the attributes holding the partition and sort key of a table.
#[derive(Debug, Clone)]
pub struct KeySchema {
    pub partition_attr: String,
    pub sort_attr: String,
}

impl KeySchema {
    pub fn new(partition_attr: impl Into<String>, sort_attr: impl Into<String>) -> Self {
        Self {
            partition_attr: partition_attr.into(),
            sort_attr: sort_attr.into(),
        }
    }
}

/// A secondary index re-keying the partition on another attribute.
#[derive(Debug, Clone)]
pub struct IndexDef {
    pub name: String,
    pub sort_attr: String,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, sort_attr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sort_attr: sort_attr.into(),
        }
    }
}

/// Write precondition, evaluated against the current item state at the
/// store's commit point.
#[derive(Debug, Clone, Serialize)]
pub enum Condition {
    /// The named attribute currently equals the given value. Implies the
    /// item exists.
    Equals { attr: String, value: AttrValue },
    Exists,
    NotExists,
}

impl Condition {
    pub fn equals(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Condition::Equals {
            attr: attr.into(),
            value: value.into(),
        }
    }
}

/// Partial update: attributes to set and attributes to remove.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateExpr {
    pub set: Vec<(String, AttrValue)>,
    pub remove: Vec<String>,
}

impl UpdateExpr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.set.push((attr.into(), value.into()));
        self
    }

    pub fn remove(mut self, attr: impl Into<String>) -> Self {
        self.remove.push(attr.into());
        self
    }
}

/// One element of an atomic multi-item write.
#[derive(Debug, Clone, Serialize)]
pub struct TransactUpdate {
    pub key: ItemKey,
    pub update: UpdateExpr,
    pub condition: Option<Condition>,
}

/// Range query over one partition.
///
/// `limit` caps the number of *key-matched* items scanned, before any
/// `filter` is applied; short filtered pages are the caller's problem to
/// compensate for. `last_key` in the resulting [`Page`] is `None` only
/// when the scan is genuinely exhausted.
#[derive(Debug, Clone)]
pub struct Query {
    pub partition: String,
    pub sort_prefix: Option<String>,
    pub sort_between: Option<(String, String)>,
    pub filter: Option<(String, AttrValue)>,
    pub limit: Option<usize>,
    pub start_after: Option<ItemKey>,
}

impl Query {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort_prefix: None,
            sort_between: None,
            filter: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn sort_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sort_prefix = Some(prefix.into());
        self
    }

    pub fn sort_between(mut self, low: impl Into<String>, high: impl Into<String>) -> Self {
        self.sort_between = Some((low.into(), high.into()));
        self
    }

    pub fn filter(mut self, attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.filter = Some((attr.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, key: ItemKey) -> Self {
        self.start_after = Some(key);
        self
    }
}

/// One page of query results with the cursor to resume from.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<Item>,
    pub last_key: Option<ItemKey>,
}

/// The external partitioned key-value store contract.
///
/// Implementations must provide: conditional single-key writes committed
/// only if the precondition holds at commit time with no interleaving
/// writer, all-or-nothing multi-item transactions linearizable against
/// other transactions on the same keys, and strict read-after-write
/// consistency on point reads.
#[async_trait]
pub trait ItemStore: Send + Sync {
    /// Strongly consistent point read.
    async fn get(&self, key: &ItemKey) -> Result<Option<Item>, Error>;

    /// Full-item write. With no condition this is an upsert.
    async fn put(&self, key: ItemKey, item: Item, condition: Option<Condition>)
    -> Result<(), Error>;

    /// Partial update of an existing item. A missing item fails the
    /// precondition regardless of `condition`; the primitive does not
    /// create items.
    async fn update(
        &self,
        key: &ItemKey,
        update: UpdateExpr,
        condition: Option<Condition>,
    ) -> Result<(), Error>;

    async fn delete(&self, key: &ItemKey) -> Result<(), Error>;

    /// Range scan within a partition. See [`Query`] for limit/filter
    /// ordering semantics.
    async fn query(&self, query: Query) -> Result<Page, Error>;

    /// Point/range lookup through a registered secondary index.
    async fn query_index(
        &self,
        index: &str,
        partition: &str,
        value: &AttrValue,
    ) -> Result<Vec<Item>, Error>;

    /// Atomic multi-item conditional write, all-or-nothing.
    ///
    /// With an idempotency token: resubmission of the identical operation
    /// set within the idempotency window returns the original success
    /// without re-execution; resubmission with a different set fails with
    /// `IdempotencyConflict`. Tokens bind only on commit; an aborted
    /// transaction leaves its token free.
    async fn transact_update(
        &self,
        ops: Vec<TransactUpdate>,
        token: Option<&str>,
    ) -> Result<(), Error>;
}

/// Canonical fingerprint of an operation set, used to detect idempotency
/// token reuse across different requests.
pub(crate) fn fingerprint_ops(ops: &[TransactUpdate]) -> Result<String, Error> {
    let encoded = serde_json::to_string(ops).map_err(|e| Error::Serialize(e.to_string()))?;
    Ok(blake3::hash(encoded.as_bytes()).to_hex().to_string())
}

/// Reject transact batches the store would refuse, before any I/O.
pub(crate) fn validate_transact_ops(ops: &[TransactUpdate]) -> Result<(), Error> {
    if ops.is_empty() {
        return Err(Error::InvalidRequest(
            "transaction contains no operations".to_string(),
        ));
    }
    if ops.len() > MAX_TRANSACT_ITEMS {
        return Err(Error::InvalidRequest(format!(
            "transaction contains {} operations, limit is {}",
            ops.len(),
            MAX_TRANSACT_ITEMS
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_value_accessors() {
        assert_eq!(AttrValue::from("SHOW").as_str(), Some("SHOW"));
        assert_eq!(AttrValue::Int(90).as_int(), Some(90));
        assert_eq!(AttrValue::Float(25.5).as_float(), Some(25.5));
        assert_eq!(AttrValue::Int(25).as_float(), Some(25.0));
        assert_eq!(AttrValue::Bool(true).as_bool(), Some(true));
        assert_eq!(AttrValue::from("x").as_int(), None);
    }

    #[test]
    fn timestamp_survives_json_round_trip() {
        let ts = "2026-03-14T19:30:00Z".parse::<DateTime<Utc>>().unwrap();
        let encoded = serde_json::to_string(&AttrValue::Timestamp(ts)).unwrap();
        let decoded: AttrValue = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.as_timestamp(), Some(ts));
    }

    #[test]
    fn plain_string_does_not_become_timestamp() {
        let decoded: AttrValue = serde_json::from_str("\"TICKET#C1\"").unwrap();
        assert_eq!(decoded, AttrValue::from("TICKET#C1"));
    }

    #[test]
    fn whole_number_stays_integral() {
        let decoded: AttrValue = serde_json::from_str("90").unwrap();
        assert_eq!(decoded, AttrValue::Int(90));
        let decoded: AttrValue = serde_json::from_str("25.5").unwrap();
        assert_eq!(decoded, AttrValue::Float(25.5));
    }

    #[test]
    fn fingerprint_is_order_sensitive_and_stable() {
        let op = |sort: &str| TransactUpdate {
            key: ItemKey::new("show-1", sort),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: Some(Condition::equals("status", "AVAILABLE")),
        };

        let a = fingerprint_ops(&[op("TICKET#A"), op("TICKET#B")]).unwrap();
        let b = fingerprint_ops(&[op("TICKET#A"), op("TICKET#B")]).unwrap();
        let c = fingerprint_ops(&[op("TICKET#B"), op("TICKET#A")]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn transact_batch_limits() {
        assert!(validate_transact_ops(&[]).is_err());

        let op = TransactUpdate {
            key: ItemKey::new("show-1", "TICKET#A"),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: None,
        };
        let ops = vec![op; MAX_TRANSACT_ITEMS + 1];
        assert!(matches!(
            validate_transact_ops(&ops),
            Err(Error::InvalidRequest(_))
        ));
        assert!(validate_transact_ops(&ops[..MAX_TRANSACT_ITEMS]).is_ok());
    }
}
