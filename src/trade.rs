// src/trade.rs
//! Stock-transaction ledger: a second logical table sharing the store
//! contract, partitioned by account number with a time-ordered sort key,
//! exercising the cursor-pagination contract including store-side
//! filtering.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::page::QueryResultPage;
use crate::store::{AttrValue, Item, ItemKey, ItemStore, KeySchema, Query};

/// Render a timestamp as the ledger sort key. Fixed-width microsecond
/// precision with a `Z` suffix, so lexicographic order is chronological
/// order.
pub fn trade_sort_key(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_trade_timestamp(value: &str) -> Result<DateTime<Utc>, Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| Error::Deserialize(format!("bad trade timestamp {}: {}", value, e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    pub fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            other => Err(Error::Deserialize(format!(
                "unknown trade action: {}",
                other
            ))),
        }
    }
}

/// One executed trade in an account's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockTransaction {
    pub account_number: String,
    pub timestamp: DateTime<Utc>,
    pub ticker: String,
    pub action: TradeAction,
    pub units: i64,
    pub unit_price: f64,
    pub reference: String,
}

impl StockTransaction {
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.account_number.clone(), trade_sort_key(self.timestamp))
    }

    pub fn to_item(&self) -> Item {
        let mut item = Item::new();
        item.insert(
            "accountNumber".to_string(),
            AttrValue::from(self.account_number.clone()),
        );
        item.insert(
            "timestamp".to_string(),
            AttrValue::from(trade_sort_key(self.timestamp)),
        );
        item.insert("ticker".to_string(), AttrValue::from(self.ticker.clone()));
        item.insert("tradeAction".to_string(), AttrValue::from(self.action.as_str()));
        item.insert("units".to_string(), AttrValue::Int(self.units));
        item.insert("unitPrice".to_string(), AttrValue::Float(self.unit_price));
        item.insert(
            "reference".to_string(),
            AttrValue::from(self.reference.clone()),
        );
        item
    }

    /// Decode a ledger record; unknown attributes are an error.
    pub fn from_item(item: &Item) -> Result<Self, Error> {
        let mut account_number = None;
        let mut timestamp = None;
        let mut ticker = None;
        let mut action = None;
        let mut units = None;
        let mut unit_price = None;
        let mut reference = None;

        for (attr, value) in item {
            match attr.as_str() {
                "accountNumber" => account_number = value.as_str().map(str::to_string),
                // Stored as a sort-key string; a JSON round trip may hand
                // it back as an already-parsed timestamp.
                "timestamp" => {
                    timestamp = Some(match value {
                        AttrValue::Timestamp(ts) => *ts,
                        AttrValue::String(s) => parse_trade_timestamp(s)?,
                        other => {
                            return Err(Error::Deserialize(format!(
                                "trade timestamp is not a string: {:?}",
                                other
                            )));
                        }
                    });
                }
                "ticker" => ticker = value.as_str().map(str::to_string),
                "tradeAction" => {
                    action = Some(TradeAction::parse(value.as_str().ok_or_else(|| {
                        Error::Deserialize("trade action is not a string".to_string())
                    })?)?);
                }
                "units" => units = value.as_int(),
                "unitPrice" => unit_price = value.as_float(),
                "reference" => reference = value.as_str().map(str::to_string),
                other => {
                    return Err(Error::Deserialize(format!(
                        "unknown stock transaction attribute: {}",
                        other
                    )));
                }
            }
        }

        Ok(StockTransaction {
            account_number: account_number.ok_or_else(|| {
                Error::Deserialize("stock transaction missing accountNumber".to_string())
            })?,
            timestamp: timestamp.ok_or_else(|| {
                Error::Deserialize("stock transaction missing timestamp".to_string())
            })?,
            ticker: ticker
                .ok_or_else(|| Error::Deserialize("stock transaction missing ticker".to_string()))?,
            action: action.ok_or_else(|| {
                Error::Deserialize("stock transaction missing tradeAction".to_string())
            })?,
            units: units
                .ok_or_else(|| Error::Deserialize("stock transaction missing units".to_string()))?,
            unit_price: unit_price.ok_or_else(|| {
                Error::Deserialize("stock transaction missing unitPrice".to_string())
            })?,
            reference: reference.ok_or_else(|| {
                Error::Deserialize("stock transaction missing reference".to_string())
            })?,
        })
    }
}

/// Resumption point of a paged ledger query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockTransactionKey {
    pub account_number: String,
    pub timestamp: DateTime<Utc>,
}

impl StockTransactionKey {
    pub fn to_item_key(&self) -> ItemKey {
        ItemKey::new(self.account_number.clone(), trade_sort_key(self.timestamp))
    }

    pub fn from_item_key(key: &ItemKey) -> Result<Self, Error> {
        Ok(Self {
            account_number: key.partition.clone(),
            timestamp: parse_trade_timestamp(&key.sort)?,
        })
    }
}

/// Typed operations on the ledger table.
pub struct StockTransactionDao {
    store: Arc<dyn ItemStore>,
}

impl StockTransactionDao {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    /// Key layout of the ledger table, for store construction.
    pub fn key_schema() -> KeySchema {
        KeySchema::new("accountNumber", "timestamp")
    }

    pub async fn save(&self, transaction: &StockTransaction) -> Result<(), Error> {
        self.store
            .put(transaction.key(), transaction.to_item(), None)
            .await
    }

    /// Every transaction of an account, oldest first.
    pub async fn find_by_account(&self, account: &str) -> Result<Vec<StockTransaction>, Error> {
        let mut query = Query::partition(account);
        let mut results = Vec::new();
        loop {
            let page = self.store.query(query.clone()).await?;
            for item in &page.items {
                results.push(StockTransaction::from_item(item)?);
            }
            match page.last_key {
                Some(key) => query.start_after = Some(key),
                None => break,
            }
        }
        Ok(results)
    }

    /// Transactions within an inclusive time range, via a sort-key range
    /// condition.
    pub async fn find_by_account_in_range(
        &self,
        account: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StockTransaction>, Error> {
        let mut query =
            Query::partition(account).sort_between(trade_sort_key(start), trade_sort_key(end));
        let mut results = Vec::new();
        loop {
            let page = self.store.query(query.clone()).await?;
            for item in &page.items {
                results.push(StockTransaction::from_item(item)?);
            }
            match page.last_key {
                Some(key) => query.start_after = Some(key),
                None => break,
            }
        }
        Ok(results)
    }

    /// One unfiltered page.
    pub async fn find_by_account_paged(
        &self,
        account: &str,
        page_size: usize,
        start: Option<&StockTransactionKey>,
    ) -> Result<QueryResultPage<StockTransaction, StockTransactionKey>, Error> {
        self.fetch_page(account, None, page_size, start).await
    }

    /// One page narrowed to a trade action.
    ///
    /// The store caps the raw scan before applying the filter, so a
    /// single fetch may come back short; keep fetching until `page_size`
    /// matches accumulate or the scan is exhausted, then trim overshoot
    /// and re-derive the cursor from the last row actually returned.
    pub async fn find_by_account_and_action(
        &self,
        account: &str,
        action: TradeAction,
        page_size: usize,
        start: Option<&StockTransactionKey>,
    ) -> Result<QueryResultPage<StockTransaction, StockTransactionKey>, Error> {
        if page_size == 0 {
            return Err(Error::InvalidRequest("page size must be positive".to_string()));
        }

        let mut results = Vec::new();
        let mut cursor = start.cloned();
        let mut next_key;
        loop {
            let page = self
                .fetch_page(account, Some(action), page_size, cursor.as_ref())
                .await?;
            results.extend(page.results);
            next_key = page.next_key;
            if results.len() >= page_size || next_key.is_none() {
                break;
            }
            cursor = next_key.clone();
        }

        if results.len() > page_size {
            results.truncate(page_size);
            if let Some(last) = results.last() {
                next_key = Some(StockTransactionKey {
                    account_number: last.account_number.clone(),
                    timestamp: last.timestamp,
                });
            }
        }

        Ok(QueryResultPage { results, next_key })
    }

    async fn fetch_page(
        &self,
        account: &str,
        action: Option<TradeAction>,
        page_size: usize,
        start: Option<&StockTransactionKey>,
    ) -> Result<QueryResultPage<StockTransaction, StockTransactionKey>, Error> {
        let mut query = Query::partition(account).limit(page_size);
        if let Some(action) = action {
            query = query.filter("tradeAction", action.as_str());
        }
        if let Some(start) = start {
            query = query.start_after(start.to_item_key());
        }

        let page = self.store.query(query).await?;

        let mut results = Vec::new();
        for item in &page.items {
            results.push(StockTransaction::from_item(item)?);
        }
        let next_key = match &page.last_key {
            Some(key) => Some(StockTransactionKey::from_item_key(key)?),
            None => None,
        };

        Ok(QueryResultPage { results, next_key })
    }
}
