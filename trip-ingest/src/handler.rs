use std::sync::Arc;

use tracing::{info, warn};

use trip_common::time::TimeSource;

use crate::codec::{decode, StreamEntry};
use crate::writer::{RawStoreWriter, WriteError, WriteReport};

/// What happened to one batch of stream entries.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub received: usize,
    pub decode_failures: usize,
    pub write: WriteReport,
}

/// Decodes a batch of stream entries and writes the resulting raw events.
///
/// One handler is shared by every batch; it holds no per-batch state.
pub struct IngestHandler {
    writer: RawStoreWriter,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl IngestHandler {
    pub fn new(writer: RawStoreWriter, timesource: Arc<dyn TimeSource + Send + Sync>) -> Self {
        Self { writer, timesource }
    }

    /// Entries that fail to decode are dropped and counted; they never fail the batch.
    pub async fn handle_batch(&self, entries: Vec<StreamEntry>) -> Result<BatchSummary, WriteError> {
        let received = entries.len();
        let now = self.timesource.current_time();

        let mut events = Vec::with_capacity(received);
        let mut decode_failures = 0;
        for entry in &entries {
            match decode(entry, &now) {
                Ok(event) => events.push(event),
                Err(e) => {
                    decode_failures += 1;
                    metrics::counter!("trip_ingest_decode_failures_total", &[("reason", e.reason())])
                        .increment(1);
                    warn!(
                        partition_key = entry.partition_key.as_deref().unwrap_or_default(),
                        "dropping stream entry: {}",
                        e
                    );
                }
            }
        }

        metrics::counter!("trip_ingest_entries_received_total").increment(received as u64);

        let write = self.writer.write_batch(events).await?;

        info!(
            received,
            decode_failures,
            written = write.written,
            duplicates = write.duplicates_discarded,
            failed = write.failed.len(),
            "ingestion batch processed"
        );

        Ok(BatchSummary {
            received,
            decode_failures,
            write,
        })
    }
}
