use async_trait::async_trait;
use thiserror::Error;

use crate::trip::TableItem;

pub mod memory;
pub mod postgres;

pub use memory::MemoryTripStore;
pub use postgres::PgTripStore;

/// Most items a single `batch_put` request accepts.
pub const MAX_BATCH_ITEMS: usize = 25;

/// Enumeration of errors returned by a `TripStore`.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
    #[error("failed to (de)serialize attributes of {key}: {error}")]
    SerdeError {
        key: String,
        error: serde_json::Error,
    },
    #[error("batch of {0} items exceeds the limit of {MAX_BATCH_ITEMS}")]
    BatchTooLarge(usize),
    #[error("store is unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A composite-key table holding raw and completed trip rows.
///
/// Partition key is the trip_id, sort key encodes the row kind. Implementations must be
/// safe to share across tasks: all coordination goes through per-key atomicity of the store.
#[async_trait]
pub trait TripStore: Send + Sync {
    /// Identifier of the table this store writes to.
    fn table_name(&self) -> &str;

    /// Upsert up to `MAX_BATCH_ITEMS` items in one request.
    /// Returns the items the store did not process; they can be resubmitted.
    async fn batch_put(&self, items: Vec<TableItem>) -> StoreResult<Vec<TableItem>>;

    /// Write one item, overwriting any existing item with the same key.
    async fn put(&self, item: TableItem) -> StoreResult<()>;

    /// Write one item only if its key is not taken. Returns whether the item was written.
    async fn put_if_absent(&self, item: TableItem) -> StoreResult<bool>;

    /// Every item of one partition, in sort key order.
    async fn query_partition(&self, partition_key: &str) -> StoreResult<Vec<TableItem>>;
}
