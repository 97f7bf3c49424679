use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{StoreError, StoreResult, TripStore, MAX_BATCH_ITEMS};
use crate::trip::{ItemKey, TableItem};

#[derive(Default)]
struct Inner {
    items: BTreeMap<ItemKey, TableItem>,
    // Number of items to hand back unprocessed, one entry per upcoming batch_put call.
    rejections: VecDeque<usize>,
    batch_sizes: Vec<usize>,
    puts: usize,
    fail_puts: bool,
    fail_queries: bool,
}

/// An in-process `TripStore`, ordered like the real table, with fault injection for tests.
#[derive(Clone)]
pub struct MemoryTripStore {
    table: String,
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryTripStore {
    fn default() -> Self {
        Self::new("trip_items")
    }
}

impl MemoryTripStore {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_owned(),
            inner: Default::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make upcoming `batch_put` calls leave their last `count` items unprocessed,
    /// one call per queued value.
    pub fn reject_batches(&self, counts: &[usize]) -> &Self {
        self.lock().rejections.extend(counts.iter().copied());
        self
    }

    pub fn fail_puts(&self, fail: bool) -> &Self {
        self.lock().fail_puts = fail;
        self
    }

    pub fn fail_queries(&self, fail: bool) -> &Self {
        self.lock().fail_queries = fail;
        self
    }

    /// Size of every `batch_put` request received so far, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.lock().batch_sizes.clone()
    }

    /// Number of single-item writes that reached the table.
    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    pub fn items(&self) -> Vec<TableItem> {
        self.lock().items.values().cloned().collect()
    }

    pub fn get(&self, key: &ItemKey) -> Option<TableItem> {
        self.lock().items.get(key).cloned()
    }

    pub fn insert(&self, item: TableItem) {
        self.lock().items.insert(item.key.clone(), item);
    }
}

#[async_trait]
impl TripStore for MemoryTripStore {
    fn table_name(&self) -> &str {
        &self.table
    }

    async fn batch_put(&self, mut items: Vec<TableItem>) -> StoreResult<Vec<TableItem>> {
        if items.len() > MAX_BATCH_ITEMS {
            return Err(StoreError::BatchTooLarge(items.len()));
        }

        let mut inner = self.lock();
        inner.batch_sizes.push(items.len());

        let rejected = inner.rejections.pop_front().unwrap_or(0).min(items.len());
        let unprocessed = items.split_off(items.len() - rejected);

        for item in items {
            inner.items.insert(item.key.clone(), item);
        }

        Ok(unprocessed)
    }

    async fn put(&self, item: TableItem) -> StoreResult<()> {
        let mut inner = self.lock();
        if inner.fail_puts {
            return Err(StoreError::Unavailable("put rejected".to_owned()));
        }

        inner.puts += 1;
        inner.items.insert(item.key.clone(), item);
        Ok(())
    }

    async fn put_if_absent(&self, item: TableItem) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.fail_puts {
            return Err(StoreError::Unavailable("put rejected".to_owned()));
        }
        if inner.items.contains_key(&item.key) {
            return Ok(false);
        }

        inner.puts += 1;
        inner.items.insert(item.key.clone(), item);
        Ok(true)
    }

    async fn query_partition(&self, partition_key: &str) -> StoreResult<Vec<TableItem>> {
        let inner = self.lock();
        if inner.fail_queries {
            return Err(StoreError::Unavailable("query rejected".to_owned()));
        }

        Ok(inner
            .items
            .values()
            .filter(|item| item.key.partition_key == partition_key)
            .cloned()
            .collect())
    }
}
