use sqlx::postgres::{PgPool, Postgres};
use sqlx::Transaction;
use thiserror::Error;
use tracing::warn;

use crate::listener::ChangeNotification;

#[derive(Error, Debug)]
pub enum ChangeFeedError {
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("transaction {command} failed with: {error}")]
    TransactionError { command: String, error: sqlx::Error },
}

#[derive(sqlx::FromRow)]
struct ChangeRow {
    id: i64,
    event_name: String,
    pk: Option<String>,
    sk: Option<String>,
}

/// Change notifications recorded by the `<table>_changes` outbox.
///
/// Rows are written by a trigger on the trip table and claimed here in batches.
pub struct PgChangeFeed {
    table: String,
    pool: PgPool,
}

/// A claimed batch. The rows stay locked, and are only deleted once `ack` commits.
/// Dropping the batch without acking releases the rows for another claim.
pub struct ChangeBatch {
    pub notifications: Vec<ChangeNotification>,
    tx: Transaction<'static, Postgres>,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.notifications.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty()
    }

    pub async fn ack(self) -> Result<(), ChangeFeedError> {
        self.tx
            .commit()
            .await
            .map_err(|error| ChangeFeedError::TransactionError {
                command: "COMMIT".to_owned(),
                error,
            })
    }
}

impl PgChangeFeed {
    /// `trip_table` is the table the notifications are about.
    pub fn new(trip_table: &str, pool: PgPool) -> Self {
        Self {
            table: format!("{}_changes", trip_table),
            pool,
        }
    }

    /// Claim up to `limit` pending notifications, oldest first.
    pub async fn claim(&self, limit: i64) -> Result<ChangeBatch, ChangeFeedError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| ChangeFeedError::TransactionError {
                command: "BEGIN".to_owned(),
                error,
            })?;

        let base_query = format!(
            r#"
WITH claimed AS (
    SELECT
        id
    FROM
        "{0}"
    ORDER BY
        id
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
DELETE FROM
    "{0}"
USING
    claimed
WHERE
    "{0}".id = claimed.id
RETURNING
    "{0}".id, "{0}".event_name, "{0}".pk, "{0}".sk
            "#,
            &self.table
        );

        let mut rows: Vec<ChangeRow> = sqlx::query_as(&base_query)
            .bind(limit)
            .fetch_all(&mut *tx)
            .await
            .map_err(|error| ChangeFeedError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;
        rows.sort_by_key(|row| row.id);

        let notifications = rows
            .into_iter()
            .filter_map(|row| match row.event_name.parse() {
                Ok(event_name) => Some(ChangeNotification {
                    event_name,
                    partition_key: row.pk,
                    sort_key: row.sk,
                }),
                Err(_) => {
                    warn!(id = row.id, event = %row.event_name, "dropping unknown change event");
                    None
                }
            })
            .collect();

        Ok(ChangeBatch { notifications, tx })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::ChangeKind;

    async fn insert_raw(db: &PgPool, pk: &str, sk: &str) {
        sqlx::query(
            r#"INSERT INTO "trip_items" (pk, sk, attributes) VALUES ($1, $2, '{}'::jsonb)"#,
        )
        .bind(pk)
        .bind(sk)
        .execute(db)
        .await
        .unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a PostgreSQL database at DATABASE_URL"]
    async fn test_raw_inserts_are_claimed_in_order(db: PgPool) {
        insert_raw(&db, "T1", "RAW#trip_start#2024-01-01T10:00:00").await;
        insert_raw(&db, "T1", "COMPLETED#2024-01-01T10:00:00").await;
        insert_raw(&db, "T2", "RAW#trip_end#2024-01-01T11:00:00").await;

        let feed = PgChangeFeed::new("trip_items", db.clone());
        let batch = feed.claim(10).await.unwrap();

        assert_eq!(
            batch.notifications,
            vec![
                ChangeNotification::insert("T1", "RAW#trip_start#2024-01-01T10:00:00"),
                ChangeNotification::insert("T2", "RAW#trip_end#2024-01-01T11:00:00"),
            ]
        );
        assert_eq!(batch.notifications[0].event_name, ChangeKind::Insert);
        batch.ack().await.unwrap();

        assert!(feed.claim(10).await.unwrap().is_empty());
    }
}
