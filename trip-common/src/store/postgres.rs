use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use super::{StoreError, StoreResult, TripStore, MAX_BATCH_ITEMS};
use crate::attributes::Attributes;
use crate::trip::{ItemKey, TableItem};

#[derive(sqlx::FromRow)]
struct ItemRow {
    pk: String,
    sk: String,
    attributes: sqlx::types::Json<Attributes>,
}

impl From<ItemRow> for TableItem {
    fn from(row: ItemRow) -> Self {
        TableItem {
            key: ItemKey {
                partition_key: row.pk,
                sort_key: row.sk,
            },
            attributes: row.attributes.0,
        }
    }
}

fn attributes_json(item: &TableItem) -> StoreResult<serde_json::Value> {
    serde_json::to_value(&item.attributes).map_err(|error| StoreError::SerdeError {
        key: item.key.to_string(),
        error,
    })
}

/// A `TripStore` backed by a PostgreSQL table with a `(pk, sk)` primary key.
pub struct PgTripStore {
    table: String,
    pool: PgPool,
}

impl PgTripStore {
    /// Connect lazily to PostgreSQL; the first query opens the connection.
    pub fn new(table: &str, url: &str, max_connections: u32) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self::new_from_pool(table, pool))
    }

    pub fn new_from_pool(table: &str, pool: PgPool) -> Self {
        Self {
            table: table.to_owned(),
            pool,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TripStore for PgTripStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn batch_put(&self, items: Vec<TableItem>) -> StoreResult<Vec<TableItem>> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(StoreError::BatchTooLarge(items.len()));
        }
        if items.is_empty() {
            return Ok(Vec::new());
        }

        let mut pks = Vec::with_capacity(items.len());
        let mut sks = Vec::with_capacity(items.len());
        let mut attributes = Vec::with_capacity(items.len());
        for item in &items {
            pks.push(item.key.partition_key.clone());
            sks.push(item.key.sort_key.clone());
            attributes.push(attributes_json(item)?);
        }

        let query = format!(
            r#"
INSERT INTO "{0}" (pk, sk, attributes)
    (SELECT * FROM UNNEST(
        $1::text[],
        $2::text[],
        $3::jsonb[]))
ON CONFLICT (pk, sk) DO UPDATE
    SET attributes = EXCLUDED.attributes, updated_at = NOW()
            "#,
            &self.table
        );

        let result = sqlx::query(&query)
            .bind(&pks)
            .bind(&sks)
            .bind(&attributes)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        debug!(
            table = self.table,
            rows = result.rows_affected(),
            "batch upsert applied"
        );

        // A statement either applies every row or fails as a whole.
        Ok(Vec::new())
    }

    async fn put(&self, item: TableItem) -> StoreResult<()> {
        let attributes = attributes_json(&item)?;
        let query = format!(
            r#"
INSERT INTO "{0}" (pk, sk, attributes)
VALUES ($1, $2, $3)
ON CONFLICT (pk, sk) DO UPDATE
    SET attributes = EXCLUDED.attributes, updated_at = NOW()
            "#,
            &self.table
        );

        sqlx::query(&query)
            .bind(&item.key.partition_key)
            .bind(&item.key.sort_key)
            .bind(attributes)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn put_if_absent(&self, item: TableItem) -> StoreResult<bool> {
        let attributes = attributes_json(&item)?;
        let query = format!(
            r#"
INSERT INTO "{0}" (pk, sk, attributes)
VALUES ($1, $2, $3)
ON CONFLICT (pk, sk) DO NOTHING
            "#,
            &self.table
        );

        let result = sqlx::query(&query)
            .bind(&item.key.partition_key)
            .bind(&item.key.sort_key)
            .bind(attributes)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(result.rows_affected() == 1)
    }

    async fn query_partition(&self, partition_key: &str) -> StoreResult<Vec<TableItem>> {
        let query = format!(
            r#"
SELECT pk, sk, attributes
FROM "{0}"
WHERE pk = $1
ORDER BY sk COLLATE "C"
            "#,
            &self.table
        );

        let rows: Vec<ItemRow> = sqlx::query_as(&query)
            .bind(partition_key)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(TableItem::from).collect())
    }
}
