use std::str::FromStr;
use std::sync::Arc;

use tracing::{error, info, warn};

use trip_common::store::TripStore;
use trip_common::trip::CompletedTrip;

use crate::trigger::{ExecutionHandle, WorkflowTrigger};

/// How the completed row is written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CompletionWriteMode {
    /// Overwrite any existing completed row and trigger every time.
    #[default]
    Overwrite,
    /// Write only when no completed row exists yet; otherwise skip the trigger.
    IfAbsent,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownWriteMode(pub String);

impl FromStr for CompletionWriteMode {
    type Err = UnknownWriteMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "overwrite" => Ok(CompletionWriteMode::Overwrite),
            "if_absent" => Ok(CompletionWriteMode::IfAbsent),
            invalid => Err(UnknownWriteMode(invalid.to_owned())),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CompletionOutcome {
    Triggered(ExecutionHandle),
    /// The completed row could not be written; the trigger was not called.
    PersistFailed,
    /// The completed row was written but the workflow did not start. The row stays.
    TriggerFailed,
    /// Only in `IfAbsent` mode: a completed row already existed.
    AlreadyCompleted,
}

impl CompletionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            CompletionOutcome::Triggered(_) => "triggered",
            CompletionOutcome::PersistFailed => "persist_failed",
            CompletionOutcome::TriggerFailed => "trigger_failed",
            CompletionOutcome::AlreadyCompleted => "already_completed",
        }
    }
}

/// Persists completed trips and starts their workflow.
#[derive(Clone)]
pub struct CompletionWriter {
    store: Arc<dyn TripStore>,
    trigger: Arc<dyn WorkflowTrigger>,
    mode: CompletionWriteMode,
}

impl CompletionWriter {
    pub fn new(
        store: Arc<dyn TripStore>,
        trigger: Arc<dyn WorkflowTrigger>,
        mode: CompletionWriteMode,
    ) -> Self {
        Self {
            store,
            trigger,
            mode,
        }
    }

    /// Write the completed row, then trigger the workflow once if the write succeeded.
    pub async fn complete(&self, trip: &CompletedTrip) -> CompletionOutcome {
        let item = trip.to_item();
        let key = item.key.clone();

        let persisted = match self.mode {
            CompletionWriteMode::Overwrite => self.store.put(item).await.map(|_| true),
            CompletionWriteMode::IfAbsent => self.store.put_if_absent(item).await,
        };

        match persisted {
            Ok(true) => {}
            Ok(false) => {
                info!(key = %key, "trip already completed, not triggering again");
                return CompletionOutcome::AlreadyCompleted;
            }
            Err(e) => {
                error!(key = %key, "failed to persist completed trip: {}", e);
                return CompletionOutcome::PersistFailed;
            }
        }

        let start = tokio::time::Instant::now();
        let outcome = match self.trigger.start(&trip.trip_id).await {
            Ok(handle) => {
                info!(
                    trip_id = %trip.trip_id,
                    execution_id = %handle.execution_id,
                    "started trip workflow"
                );
                CompletionOutcome::Triggered(handle)
            }
            Err(e) => {
                warn!(trip_id = %trip.trip_id, "completed trip was persisted but the workflow did not start: {}", e);
                CompletionOutcome::TriggerFailed
            }
        };
        metrics::histogram!("trip_joiner_trigger_duration_seconds")
            .record(start.elapsed().as_secs_f64());

        outcome
    }
}
