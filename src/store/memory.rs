// src/store/memory.rs
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::Error;
use crate::store::{
    AttrValue, Condition, DEFAULT_IDEMPOTENCY_WINDOW, IndexDef, Item, ItemKey, ItemStore,
    KeySchema, Page, Query, TransactUpdate, UpdateExpr, fingerprint_ops, validate_transact_ops,
};

struct TokenRecord {
    fingerprint: String,
    stored_at: Instant,
}

/// Process-local [`ItemStore`] with the full conditional-write,
/// transaction, idempotency-window and cursor semantics of the external
/// store. The reference substrate for tests and single-process use.
///
/// A single interior mutex over the item map makes every conditional
/// write and transaction linearizable; lock acquisition order is always
/// tokens before items.
pub struct MemoryStore {
    schema: KeySchema,
    indexes: Vec<IndexDef>,
    items: Mutex<BTreeMap<(String, String), Item>>,
    tokens: Mutex<HashMap<String, TokenRecord>>,
    idempotency_window: Duration,
}

impl MemoryStore {
    pub fn new(schema: KeySchema) -> Self {
        Self {
            schema,
            indexes: Vec::new(),
            items: Mutex::new(BTreeMap::new()),
            tokens: Mutex::new(HashMap::new()),
            idempotency_window: DEFAULT_IDEMPOTENCY_WINDOW,
        }
    }

    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn with_idempotency_window(mut self, window: Duration) -> Self {
        self.idempotency_window = window;
        self
    }

    fn sort_matches(query: &Query, sort: &str) -> bool {
        if let Some(prefix) = &query.sort_prefix {
            if !sort.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some((low, high)) = &query.sort_between {
            if sort < low.as_str() || sort > high.as_str() {
                return false;
            }
        }
        true
    }
}

fn condition_holds(condition: Option<&Condition>, existing: Option<&Item>) -> bool {
    match condition {
        None => true,
        Some(Condition::Exists) => existing.is_some(),
        Some(Condition::NotExists) => existing.is_none(),
        Some(Condition::Equals { attr, value }) => {
            existing.is_some_and(|item| item.get(attr) == Some(value))
        }
    }
}

fn apply_update(item: &mut Item, update: &UpdateExpr) {
    for (attr, value) in &update.set {
        item.insert(attr.clone(), value.clone());
    }
    for attr in &update.remove {
        item.remove(attr);
    }
}

#[async_trait]
impl ItemStore for MemoryStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<Item>, Error> {
        let items = self.items.lock().unwrap();
        Ok(items.get(&(key.partition.clone(), key.sort.clone())).cloned())
    }

    async fn put(
        &self,
        key: ItemKey,
        mut item: Item,
        condition: Option<Condition>,
    ) -> Result<(), Error> {
        let mut items = self.items.lock().unwrap();
        let map_key = (key.partition.clone(), key.sort.clone());

        if !condition_holds(condition.as_ref(), items.get(&map_key)) {
            return Err(Error::PreconditionFailed);
        }

        // Key attributes are part of the item, as in the external store.
        item.insert(
            self.schema.partition_attr.clone(),
            AttrValue::String(key.partition),
        );
        item.insert(self.schema.sort_attr.clone(), AttrValue::String(key.sort));

        items.insert(map_key, item);
        Ok(())
    }

    async fn update(
        &self,
        key: &ItemKey,
        update: UpdateExpr,
        condition: Option<Condition>,
    ) -> Result<(), Error> {
        let mut items = self.items.lock().unwrap();
        let map_key = (key.partition.clone(), key.sort.clone());

        if !condition_holds(condition.as_ref(), items.get(&map_key)) {
            return Err(Error::PreconditionFailed);
        }
        match items.get_mut(&map_key) {
            Some(item) => {
                apply_update(item, &update);
                Ok(())
            }
            // Updates never create items.
            None => Err(Error::PreconditionFailed),
        }
    }

    async fn delete(&self, key: &ItemKey) -> Result<(), Error> {
        let mut items = self.items.lock().unwrap();
        items.remove(&(key.partition.clone(), key.sort.clone()));
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Page, Error> {
        let items = self.items.lock().unwrap();

        let start = match &query.start_after {
            Some(key) => Bound::Excluded((key.partition.clone(), key.sort.clone())),
            None => Bound::Included((query.partition.clone(), String::new())),
        };

        let mut matched = items
            .range((start, Bound::Unbounded))
            .take_while(|((partition, _), _)| partition == &query.partition)
            .filter(|((_, sort), _)| Self::sort_matches(&query, sort));

        let mut raw: Vec<(ItemKey, Item)> = Vec::new();
        let mut last_key = None;

        for ((partition, sort), item) in &mut matched {
            if let Some(limit) = query.limit {
                if raw.len() == limit {
                    // More key-matched items remain past the limit, so the
                    // scan is not exhausted.
                    last_key = raw.last().map(|(key, _)| key.clone());
                    break;
                }
            }
            raw.push((ItemKey::new(partition.clone(), sort.clone()), item.clone()));
        }

        // The store caps the raw scan first; the filter runs on what the
        // cap let through.
        let results = match &query.filter {
            Some((attr, value)) => raw
                .into_iter()
                .filter(|(_, item)| item.get(attr) == Some(value))
                .map(|(_, item)| item)
                .collect(),
            None => raw.into_iter().map(|(_, item)| item).collect(),
        };

        Ok(Page {
            items: results,
            last_key,
        })
    }

    async fn query_index(
        &self,
        index: &str,
        partition: &str,
        value: &AttrValue,
    ) -> Result<Vec<Item>, Error> {
        let index = self
            .indexes
            .iter()
            .find(|def| def.name == index)
            .ok_or_else(|| Error::InvalidRequest(format!("unknown index: {}", index)))?;

        let items = self.items.lock().unwrap();
        Ok(items
            .range((
                Bound::Included((partition.to_string(), String::new())),
                Bound::Unbounded,
            ))
            .take_while(|((p, _), _)| p == partition)
            .filter(|(_, item)| item.get(&index.sort_attr) == Some(value))
            .map(|(_, item)| item.clone())
            .collect())
    }

    async fn transact_update(
        &self,
        ops: Vec<TransactUpdate>,
        token: Option<&str>,
    ) -> Result<(), Error> {
        validate_transact_ops(&ops)?;

        let mut tokens = self.tokens.lock().unwrap();

        let fingerprint = match token {
            Some(token) => {
                let window = self.idempotency_window;
                tokens.retain(|_, record| record.stored_at.elapsed() < window);

                let fingerprint = fingerprint_ops(&ops)?;
                if let Some(record) = tokens.get(token) {
                    if record.fingerprint == fingerprint {
                        // Pure replay: the original outcome stands, nothing
                        // is re-executed.
                        return Ok(());
                    }
                    return Err(Error::IdempotencyConflict);
                }
                Some(fingerprint)
            }
            None => None,
        };

        let mut items = self.items.lock().unwrap();

        for op in &ops {
            let map_key = (op.key.partition.clone(), op.key.sort.clone());
            let existing = items.get(&map_key);
            if existing.is_none() || !condition_holds(op.condition.as_ref(), existing) {
                return Err(Error::TransactionAborted);
            }
        }

        for op in &ops {
            let map_key = (op.key.partition.clone(), op.key.sort.clone());
            if let Some(item) = items.get_mut(&map_key) {
                apply_update(item, &op.update);
            }
        }

        // Tokens bind only on commit; an aborted transaction above left
        // the token free for a retry.
        if let (Some(token), Some(fingerprint)) = (token, fingerprint) {
            tokens.insert(
                token.to_string(),
                TokenRecord {
                    fingerprint,
                    stored_at: Instant::now(),
                },
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new(KeySchema::new("showId", "sortKey"))
    }

    fn seat(status: &str) -> Item {
        let mut item = Item::new();
        item.insert("status".to_string(), AttrValue::from(status));
        item.insert("price".to_string(), AttrValue::Float(25.0));
        item
    }

    #[tokio::test]
    async fn put_merges_key_attributes() {
        let store = store();
        let key = ItemKey::new("show-1", "TICKET#A");
        store.put(key.clone(), seat("AVAILABLE"), None).await.unwrap();

        let item = store.get(&key).await.unwrap().unwrap();
        assert_eq!(item.get("showId"), Some(&AttrValue::from("show-1")));
        assert_eq!(item.get("sortKey"), Some(&AttrValue::from("TICKET#A")));
    }

    #[tokio::test]
    async fn conditional_put_not_exists() {
        let store = store();
        let key = ItemKey::new("show-1", "TICKET#A");
        store
            .put(key.clone(), seat("AVAILABLE"), Some(Condition::NotExists))
            .await
            .unwrap();

        let err = store
            .put(key, seat("AVAILABLE"), Some(Condition::NotExists))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed));
    }

    #[tokio::test]
    async fn conditional_update_checks_current_value() {
        let store = store();
        let key = ItemKey::new("show-1", "TICKET#A");
        store.put(key.clone(), seat("AVAILABLE"), None).await.unwrap();

        store
            .update(
                &key,
                UpdateExpr::new().set("status", "RESERVED"),
                Some(Condition::equals("status", "AVAILABLE")),
            )
            .await
            .unwrap();

        let err = store
            .update(
                &key,
                UpdateExpr::new().set("status", "RESERVED"),
                Some(Condition::equals("status", "AVAILABLE")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed));
    }

    #[tokio::test]
    async fn update_on_missing_item_fails_precondition() {
        let store = store();
        let err = store
            .update(
                &ItemKey::new("show-1", "TICKET#GHOST"),
                UpdateExpr::new().set("status", "RESERVED"),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed));
    }

    #[tokio::test]
    async fn update_remove_drops_attribute() {
        let store = store();
        let key = ItemKey::new("show-1", "TICKET#A");
        let mut item = seat("RESERVED");
        item.insert("ticketRef".to_string(), AttrValue::from("ref-1"));
        store.put(key.clone(), item, None).await.unwrap();

        store
            .update(
                &key,
                UpdateExpr::new().set("status", "AVAILABLE").remove("ticketRef"),
                None,
            )
            .await
            .unwrap();

        let item = store.get(&key).await.unwrap().unwrap();
        assert_eq!(item.get("status"), Some(&AttrValue::from("AVAILABLE")));
        assert!(item.get("ticketRef").is_none());
    }

    #[tokio::test]
    async fn query_applies_limit_before_filter() {
        let store = store();
        // Ten tickets, alternating status; raw limit 4 sees two of each.
        for i in 0..10 {
            let status = if i % 2 == 0 { "AVAILABLE" } else { "RESERVED" };
            store
                .put(
                    ItemKey::new("show-1", format!("TICKET#{:02}", i)),
                    seat(status),
                    None,
                )
                .await
                .unwrap();
        }

        let page = store
            .query(
                Query::partition("show-1")
                    .sort_prefix("TICKET#")
                    .filter("status", "AVAILABLE")
                    .limit(4),
            )
            .await
            .unwrap();

        assert_eq!(page.items.len(), 2);
        assert_eq!(
            page.last_key,
            Some(ItemKey::new("show-1", "TICKET#03"))
        );
    }

    #[tokio::test]
    async fn query_cursor_is_none_only_when_exhausted() {
        let store = store();
        for i in 0..6 {
            store
                .put(
                    ItemKey::new("show-1", format!("TICKET#{:02}", i)),
                    seat("AVAILABLE"),
                    None,
                )
                .await
                .unwrap();
        }

        let page = store
            .query(Query::partition("show-1").sort_prefix("TICKET#").limit(6))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 6);
        assert!(page.last_key.is_none());

        let page = store
            .query(Query::partition("show-1").sort_prefix("TICKET#").limit(4))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 4);
        let cursor = page.last_key.expect("scan stopped at the limit");

        let page = store
            .query(
                Query::partition("show-1")
                    .sort_prefix("TICKET#")
                    .limit(4)
                    .start_after(cursor),
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.last_key.is_none());
    }

    #[tokio::test]
    async fn query_sort_between_is_inclusive() {
        let store = store();
        for sort in ["2026-01-01", "2026-02-01", "2026-03-01"] {
            store
                .put(ItemKey::new("acct-1", sort), seat("AVAILABLE"), None)
                .await
                .unwrap();
        }

        let page = store
            .query(Query::partition("acct-1").sort_between("2026-01-01", "2026-02-01"))
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let store = store();
        store
            .put(ItemKey::new("show-1", "TICKET#A"), seat("AVAILABLE"), None)
            .await
            .unwrap();
        store
            .put(ItemKey::new("show-1", "TICKET#B"), seat("RESERVED"), None)
            .await
            .unwrap();

        let reserve = |sort: &str| TransactUpdate {
            key: ItemKey::new("show-1", sort),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: Some(Condition::equals("status", "AVAILABLE")),
        };

        let err = store
            .transact_update(vec![reserve("TICKET#A"), reserve("TICKET#B")], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionAborted));

        let item = store
            .get(&ItemKey::new("show-1", "TICKET#A"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.get("status"), Some(&AttrValue::from("AVAILABLE")));
    }

    #[tokio::test]
    async fn token_replay_and_conflict() {
        let store = store();
        store
            .put(ItemKey::new("show-1", "TICKET#A"), seat("AVAILABLE"), None)
            .await
            .unwrap();

        let reserve = |sort: &str| TransactUpdate {
            key: ItemKey::new("show-1", sort),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: Some(Condition::equals("status", "AVAILABLE")),
        };

        store
            .transact_update(vec![reserve("TICKET#A")], Some("tok-1"))
            .await
            .unwrap();

        // Identical resubmission replays the original success even though
        // the precondition no longer holds.
        store
            .transact_update(vec![reserve("TICKET#A")], Some("tok-1"))
            .await
            .unwrap();

        let err = store
            .transact_update(vec![reserve("TICKET#B")], Some("tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IdempotencyConflict));
    }

    #[tokio::test]
    async fn aborted_transaction_leaves_token_unbound() {
        let store = store();
        store
            .put(ItemKey::new("show-1", "TICKET#A"), seat("RESERVED"), None)
            .await
            .unwrap();

        let reserve = TransactUpdate {
            key: ItemKey::new("show-1", "TICKET#A"),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: Some(Condition::equals("status", "AVAILABLE")),
        };

        let err = store
            .transact_update(vec![reserve.clone()], Some("tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionAborted));

        // Free the seat; the same token retries and now executes for real.
        store
            .update(
                &ItemKey::new("show-1", "TICKET#A"),
                UpdateExpr::new().set("status", "AVAILABLE"),
                None,
            )
            .await
            .unwrap();
        store
            .transact_update(vec![reserve], Some("tok-1"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn expired_token_re_executes() {
        let store = store().with_idempotency_window(Duration::from_millis(0));
        store
            .put(ItemKey::new("show-1", "TICKET#A"), seat("AVAILABLE"), None)
            .await
            .unwrap();

        let reserve = TransactUpdate {
            key: ItemKey::new("show-1", "TICKET#A"),
            update: UpdateExpr::new().set("status", "RESERVED"),
            condition: Some(Condition::equals("status", "AVAILABLE")),
        };

        store
            .transact_update(vec![reserve.clone()], Some("tok-1"))
            .await
            .unwrap();

        // The window elapsed, so the replay protection is gone and the
        // precondition is checked again for real.
        let err = store
            .transact_update(vec![reserve], Some("tok-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionAborted));
    }

    #[tokio::test]
    async fn index_lookup_requires_registered_index() {
        let store = store();
        let err = store
            .query_index("no-such-index", "show-1", &AttrValue::from("ref"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn index_lookup_finds_item_by_attribute() {
        let store = MemoryStore::new(KeySchema::new("showId", "sortKey"))
            .with_index(IndexDef::new("ticket-ref-index", "ticketRef"));

        let mut item = seat("RESERVED");
        item.insert("ticketRef".to_string(), AttrValue::from("ref-9"));
        store
            .put(ItemKey::new("show-1", "TICKET#A"), item, None)
            .await
            .unwrap();

        let found = store
            .query_index("ticket-ref-index", "show-1", &AttrValue::from("ref-9"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);

        let missing = store
            .query_index("ticket-ref-index", "show-1", &AttrValue::from("ref-0"))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
