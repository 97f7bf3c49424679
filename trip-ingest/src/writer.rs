use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use trip_common::retry::RetryPolicy;
use trip_common::store::{TripStore, MAX_BATCH_ITEMS};
use trip_common::trip::{ItemKey, RawTripEvent, TableItem};

/// Attempts made for one chunk before its leftover items are reported failed.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

const RETRY_JITTER_MS: u64 = 50;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum WriteError {
    #[error("no target table configured for raw trip events")]
    MissingTable,
}

/// Outcome of writing one batch of raw events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub duplicates_discarded: usize,
    /// Keys of the items still unprocessed once their chunk ran out of attempts.
    pub failed: Vec<ItemKey>,
    pub chunks: usize,
}

/// Deduplicates raw events and persists them with bounded, chunked batch writes.
pub struct RawStoreWriter {
    store: Arc<dyn TripStore>,
    retry_policy: RetryPolicy,
}

impl RawStoreWriter {
    pub fn new(store: Arc<dyn TripStore>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            retry_policy,
        }
    }

    /// Write a batch of raw events.
    ///
    /// Partial failures never surface as an error: items the store keeps rejecting after
    /// `MAX_WRITE_ATTEMPTS` are logged and listed in the report, and the batch moves on.
    pub async fn write_batch(&self, events: Vec<RawTripEvent>) -> Result<WriteReport, WriteError> {
        if self.store.table_name().trim().is_empty() {
            return Err(WriteError::MissingTable);
        }

        let (items, duplicates_discarded) = deduplicate(events);
        let mut report = WriteReport {
            duplicates_discarded,
            ..Default::default()
        };

        if duplicates_discarded > 0 {
            metrics::counter!("trip_ingest_duplicates_discarded_total")
                .increment(duplicates_discarded as u64);
        }
        if items.is_empty() {
            debug!("no raw events left to write after deduplication");
            return Ok(report);
        }

        info!(
            unique = items.len(),
            duplicates = duplicates_discarded,
            "writing raw trip events"
        );

        let mut items = items.into_iter().peekable();
        while items.peek().is_some() {
            let chunk: Vec<TableItem> = items.by_ref().take(MAX_BATCH_ITEMS).collect();
            let chunk_index = report.chunks;
            report.chunks += 1;

            let chunk_len = chunk.len();
            let failed = self.write_chunk(chunk_index, chunk).await;
            report.written += chunk_len - failed.len();
            report.failed.extend(failed.into_iter().map(|item| item.key));
        }

        metrics::counter!("trip_ingest_items_written_total").increment(report.written as u64);
        if !report.failed.is_empty() {
            metrics::counter!("trip_ingest_items_failed_total")
                .increment(report.failed.len() as u64);
        }
        metrics::histogram!("trip_ingest_chunks_per_batch").record(report.chunks as f64);

        Ok(report)
    }

    /// Submit one chunk, resubmitting only what the store leaves unprocessed.
    /// Returns the items that were never processed.
    async fn write_chunk(&self, chunk_index: usize, chunk: Vec<TableItem>) -> Vec<TableItem> {
        let mut pending = chunk;
        let mut attempt = 0;

        while !pending.is_empty() && attempt < MAX_WRITE_ATTEMPTS {
            attempt += 1;

            match self.store.batch_put(pending.clone()).await {
                Ok(unprocessed) if unprocessed.is_empty() => {
                    debug!(chunk = chunk_index, attempt, "chunk written");
                    return Vec::new();
                }
                Ok(unprocessed) => {
                    metrics::counter!("trip_ingest_chunk_retries_total", &[("cause", "unprocessed")])
                        .increment(1);
                    warn!(
                        chunk = chunk_index,
                        attempt,
                        unprocessed = unprocessed.len(),
                        "store left items unprocessed"
                    );
                    pending = unprocessed;
                }
                Err(e) => {
                    // The whole request failed, so every pending item is still unprocessed.
                    metrics::counter!("trip_ingest_chunk_retries_total", &[("cause", "error")])
                        .increment(1);
                    warn!(
                        chunk = chunk_index,
                        attempt,
                        pending = pending.len(),
                        "batch write failed: {}",
                        e
                    );
                }
            }

            if attempt < MAX_WRITE_ATTEMPTS {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        if !pending.is_empty() {
            error!(
                chunk = chunk_index,
                attempts = attempt,
                failed = pending.len(),
                "giving up on unprocessed raw events"
            );
            for item in &pending {
                error!(key = %item.key, "raw event was not written");
            }
        }

        pending
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let interval = self.retry_policy.time_until_next_retry(attempt);
        if interval.is_zero() {
            return interval;
        }
        interval + Duration::from_millis(rand::random::<u64>() % RETRY_JITTER_MS)
    }
}

/// Keep the first event of every identity, in input order, and count the rest.
fn deduplicate(events: Vec<RawTripEvent>) -> (Vec<TableItem>, usize) {
    let mut seen = HashSet::with_capacity(events.len());
    let mut items = Vec::with_capacity(events.len());
    let mut duplicates = 0;

    for event in events {
        let item = event.to_item();
        if seen.insert(item.key.clone()) {
            items.push(item);
        } else {
            duplicates += 1;
            warn!(key = %item.key, "discarding duplicate raw event");
        }
    }

    (items, duplicates)
}
