// src/store/postgres.rs
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};

use crate::error::Error;
use crate::store::{
    AttrValue, Condition, DEFAULT_IDEMPOTENCY_WINDOW, IndexDef, Item, ItemKey, ItemStore,
    KeySchema, Page, Query, TransactUpdate, UpdateExpr, fingerprint_ops, validate_transact_ops,
};

fn storage_err(e: sqlx::Error) -> Error {
    Error::StoreUnavailable(e.to_string())
}

fn encode_err(e: serde_json::Error) -> Error {
    Error::Serialize(e.to_string())
}

fn decode_err(e: serde_json::Error) -> Error {
    Error::Deserialize(e.to_string())
}

/// sqlx-backed [`ItemStore`]. Each logical table is one relation of
/// `(partition_key, sort_key, attrs JSONB)` plus a companion token table
/// for idempotent transactions. Conditional writes are guarded UPDATEs;
/// transactions rely on row locks taken by those UPDATEs inside one
/// database transaction.
pub struct PostgresStore {
    pool: PgPool,
    table: String,
    token_table: String,
    schema: KeySchema,
    indexes: Vec<IndexDef>,
    idempotency_window: Duration,
}

impl PostgresStore {
    pub fn new(pool: PgPool, table: impl Into<String>, schema: KeySchema) -> Self {
        let table = table.into();
        let token_table = format!("{}_tokens", table);
        Self {
            pool,
            table,
            token_table,
            schema,
            indexes: Vec::new(),
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

    /// Create the table, token table and secondary-index expressions if
    /// they do not exist yet.
    pub async fn init_schema(&self) -> Result<(), Error> {
        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                partition_key TEXT NOT NULL,
                sort_key TEXT COLLATE "C" NOT NULL,
                attrs JSONB NOT NULL,
                PRIMARY KEY (partition_key, sort_key)
            )
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                token TEXT PRIMARY KEY,
                fingerprint TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            self.token_table
        ))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for index in &self.indexes {
            let index_ident = format!(
                "{}_{}",
                self.table,
                index.name.replace('-', "_")
            );
            sqlx::query(&format!(
                r#"
                CREATE INDEX IF NOT EXISTS {} ON {} (partition_key, (attrs ->> '{}'))
                "#,
                index_ident, self.table, index.sort_attr
            ))
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        }

        Ok(())
    }

    fn merge_key_attrs(&self, item: &mut Item, key: &ItemKey) {
        item.insert(
            self.schema.partition_attr.clone(),
            AttrValue::String(key.partition.clone()),
        );
        item.insert(
            self.schema.sort_attr.clone(),
            AttrValue::String(key.sort.clone()),
        );
    }

    async fn apply_conditional_update(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        table: &str,
        op: &TransactUpdate,
    ) -> Result<bool, Error> {
        let sets: serde_json::Map<String, serde_json::Value> = op
            .update
            .set
            .iter()
            .map(|(attr, value)| {
                serde_json::to_value(value).map(|encoded| (attr.clone(), encoded))
            })
            .collect::<Result<_, _>>()
            .map_err(encode_err)?;

        let mut sql = format!(
            "UPDATE {} SET attrs = (attrs || $3::jsonb) - $4::text[] \
             WHERE partition_key = $1 AND sort_key = $2",
            table
        );
        match &op.condition {
            Some(Condition::Equals { .. }) => {
                sql.push_str(" AND attrs @> jsonb_build_object($5::text, $6::jsonb)");
            }
            Some(Condition::NotExists) => {
                // An update can never satisfy NotExists.
                return Ok(false);
            }
            Some(Condition::Exists) | None => {}
        }

        let mut query = sqlx::query(&sql)
            .bind(&op.key.partition)
            .bind(&op.key.sort)
            .bind(serde_json::Value::Object(sets))
            .bind(&op.update.remove);
        if let Some(Condition::Equals { attr, value }) = &op.condition {
            query = query
                .bind(attr)
                .bind(serde_json::to_value(value).map_err(encode_err)?);
        }

        let result = query.execute(&mut **tx).await.map_err(storage_err)?;
        Ok(result.rows_affected() == 1)
    }

    fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<Item, Error> {
        let attrs: serde_json::Value = row.try_get("attrs").map_err(storage_err)?;
        serde_json::from_value(attrs).map_err(decode_err)
    }
}

#[async_trait]
impl ItemStore for PostgresStore {
    async fn get(&self, key: &ItemKey) -> Result<Option<Item>, Error> {
        let row = sqlx::query(&format!(
            "SELECT attrs FROM {} WHERE partition_key = $1 AND sort_key = $2",
            self.table
        ))
        .bind(&key.partition)
        .bind(&key.sort)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_err)?;

        match row {
            Some(row) => Ok(Some(Self::row_to_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        key: ItemKey,
        mut item: Item,
        condition: Option<Condition>,
    ) -> Result<(), Error> {
        self.merge_key_attrs(&mut item, &key);
        let attrs = serde_json::to_value(&item).map_err(encode_err)?;

        let result = match &condition {
            None => sqlx::query(&format!(
                "INSERT INTO {} (partition_key, sort_key, attrs) VALUES ($1, $2, $3) \
                 ON CONFLICT (partition_key, sort_key) DO UPDATE SET attrs = EXCLUDED.attrs",
                self.table
            ))
            .bind(&key.partition)
            .bind(&key.sort)
            .bind(&attrs)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?,
            Some(Condition::NotExists) => sqlx::query(&format!(
                "INSERT INTO {} (partition_key, sort_key, attrs) VALUES ($1, $2, $3) \
                 ON CONFLICT (partition_key, sort_key) DO NOTHING",
                self.table
            ))
            .bind(&key.partition)
            .bind(&key.sort)
            .bind(&attrs)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?,
            Some(Condition::Exists) => sqlx::query(&format!(
                "UPDATE {} SET attrs = $3 WHERE partition_key = $1 AND sort_key = $2",
                self.table
            ))
            .bind(&key.partition)
            .bind(&key.sort)
            .bind(&attrs)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?,
            Some(Condition::Equals { attr, value }) => sqlx::query(&format!(
                "UPDATE {} SET attrs = $3 WHERE partition_key = $1 AND sort_key = $2 \
                 AND attrs @> jsonb_build_object($4::text, $5::jsonb)",
                self.table
            ))
            .bind(&key.partition)
            .bind(&key.sort)
            .bind(&attrs)
            .bind(attr)
            .bind(serde_json::to_value(value).map_err(encode_err)?)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?,
        };

        if result.rows_affected() == 1 {
            Ok(())
        } else {
            Err(Error::PreconditionFailed)
        }
    }

    async fn update(
        &self,
        key: &ItemKey,
        update: UpdateExpr,
        condition: Option<Condition>,
    ) -> Result<(), Error> {
        let op = TransactUpdate {
            key: key.clone(),
            update,
            condition,
        };

        let mut tx = self.pool.begin().await.map_err(storage_err)?;
        let applied = Self::apply_conditional_update(&mut tx, &self.table, &op).await?;
        if !applied {
            return Err(Error::PreconditionFailed);
        }
        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &ItemKey) -> Result<(), Error> {
        sqlx::query(&format!(
            "DELETE FROM {} WHERE partition_key = $1 AND sort_key = $2",
            self.table
        ))
        .bind(&key.partition)
        .bind(&key.sort)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<Page, Error> {
        let mut sql = format!(
            "SELECT sort_key, attrs FROM {} WHERE partition_key = $1",
            self.table
        );
        let mut placeholder = 1;
        if query.sort_prefix.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND sort_key LIKE ${} || '%'", placeholder));
        }
        if query.sort_between.is_some() {
            sql.push_str(&format!(
                " AND sort_key BETWEEN ${} AND ${}",
                placeholder + 1,
                placeholder + 2
            ));
            placeholder += 2;
        }
        if query.start_after.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND sort_key > ${}", placeholder));
        }
        sql.push_str(" ORDER BY sort_key");
        if let Some(limit) = query.limit {
            // One extra row decides whether the scan is exhausted.
            sql.push_str(&format!(" LIMIT {}", limit + 1));
        }

        let mut prepared = sqlx::query(&sql).bind(&query.partition);
        if let Some(prefix) = &query.sort_prefix {
            prepared = prepared.bind(prefix);
        }
        if let Some((low, high)) = &query.sort_between {
            prepared = prepared.bind(low).bind(high);
        }
        if let Some(start) = &query.start_after {
            prepared = prepared.bind(&start.sort);
        }

        let rows = prepared
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut raw = Vec::with_capacity(rows.len());
        for row in &rows {
            let sort: String = row.try_get("sort_key").map_err(storage_err)?;
            raw.push((sort, Self::row_to_item(row)?));
        }

        let mut last_key = None;
        if let Some(limit) = query.limit {
            if raw.len() > limit {
                raw.truncate(limit);
                last_key = raw
                    .last()
                    .map(|(sort, _)| ItemKey::new(query.partition.clone(), sort.clone()));
            }
        }

        // Raw scan is capped above; the filter applies to what survived.
        let items = match &query.filter {
            Some((attr, value)) => raw
                .into_iter()
                .filter(|(_, item)| item.get(attr) == Some(value))
                .map(|(_, item)| item)
                .collect(),
            None => raw.into_iter().map(|(_, item)| item).collect(),
        };

        Ok(Page { items, last_key })
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

        let rows = sqlx::query(&format!(
            "SELECT attrs FROM {} WHERE partition_key = $1 \
             AND attrs @> jsonb_build_object($2::text, $3::jsonb) ORDER BY sort_key",
            self.table
        ))
        .bind(partition)
        .bind(&index.sort_attr)
        .bind(serde_json::to_value(value).map_err(encode_err)?)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        rows.iter().map(Self::row_to_item).collect()
    }

    async fn transact_update(
        &self,
        ops: Vec<TransactUpdate>,
        token: Option<&str>,
    ) -> Result<(), Error> {
        validate_transact_ops(&ops)?;

        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        if let Some(token) = token {
            let fingerprint = fingerprint_ops(&ops)?;

            sqlx::query(&format!(
                "DELETE FROM {} WHERE created_at < NOW() - make_interval(secs => $1)",
                self.token_table
            ))
            .bind(self.idempotency_window.as_secs_f64())
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            // A fresh token claims the row; an existing one blocks here
            // until the owning transaction settles, then replays or
            // conflicts on the committed fingerprint.
            let claimed = sqlx::query(&format!(
                "INSERT INTO {} (token, fingerprint) VALUES ($1, $2) ON CONFLICT (token) DO NOTHING",
                self.token_table
            ))
            .bind(token)
            .bind(&fingerprint)
            .execute(&mut *tx)
            .await
            .map_err(storage_err)?;

            if claimed.rows_affected() == 0 {
                let row = sqlx::query(&format!(
                    "SELECT fingerprint FROM {} WHERE token = $1 FOR UPDATE",
                    self.token_table
                ))
                .bind(token)
                .fetch_one(&mut *tx)
                .await
                .map_err(storage_err)?;

                let existing: String = row.try_get("fingerprint").map_err(storage_err)?;
                if existing == fingerprint {
                    tx.commit().await.map_err(storage_err)?;
                    return Ok(());
                }
                return Err(Error::IdempotencyConflict);
            }
        }

        for op in &ops {
            let applied = Self::apply_conditional_update(&mut tx, &self.table, op).await?;
            if !applied {
                // Dropping the transaction rolls everything back,
                // including the token claim.
                return Err(Error::TransactionAborted);
            }
        }

        tx.commit().await.map_err(storage_err)?;
        Ok(())
    }
}
