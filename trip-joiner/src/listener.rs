use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, error, warn};

use trip_common::store::TripStore;
use trip_common::time::TimeSource;
use trip_common::trip::{CompletedTrip, Phase, RawTripEvent, RAW_PREFIX};

use crate::completion::{CompletionOutcome, CompletionWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Modify,
    Remove,
}

#[derive(Debug, PartialEq, Eq)]
pub struct UnknownChangeKind(pub String);

impl FromStr for ChangeKind {
    type Err = UnknownChangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(ChangeKind::Insert),
            "MODIFY" => Ok(ChangeKind::Modify),
            "REMOVE" => Ok(ChangeKind::Remove),
            other => Err(UnknownChangeKind(other.to_owned())),
        }
    }
}

/// One row change reported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub event_name: ChangeKind,
    pub partition_key: Option<String>,
    pub sort_key: Option<String>,
}

impl ChangeNotification {
    pub fn insert(partition_key: &str, sort_key: &str) -> Self {
        Self {
            event_name: ChangeKind::Insert,
            partition_key: Some(partition_key.to_owned()),
            sort_key: Some(sort_key.to_owned()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// Not a new raw row, or no partition key to join on.
    Skipped,
    QueryFailed,
    /// One of the two phases has not arrived yet.
    Incomplete,
    Completed(CompletionOutcome),
}

impl ListenerOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ListenerOutcome::Skipped => "skipped",
            ListenerOutcome::QueryFailed => "query_failed",
            ListenerOutcome::Incomplete => "incomplete",
            ListenerOutcome::Completed(outcome) => outcome.label(),
        }
    }
}

/// Reacts to new raw rows by joining the trip once both phases are stored.
#[derive(Clone)]
pub struct ChangeListener {
    store: Arc<dyn TripStore>,
    completion: CompletionWriter,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl ChangeListener {
    pub fn new(
        store: Arc<dyn TripStore>,
        completion: CompletionWriter,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self {
            store,
            completion,
            timesource,
        }
    }

    pub async fn handle(&self, notification: &ChangeNotification) -> ListenerOutcome {
        if notification.event_name != ChangeKind::Insert {
            debug!(event = ?notification.event_name, "ignoring non-insert change");
            return ListenerOutcome::Skipped;
        }

        // Completed rows land in the same table and must not re-enter the join.
        // A notification without a sort key is still joined on its partition.
        let is_other_row = notification
            .sort_key
            .as_deref()
            .is_some_and(|sort_key| !sort_key.starts_with(RAW_PREFIX));
        if is_other_row {
            debug!(sort_key = ?notification.sort_key, "ignoring non-raw row");
            return ListenerOutcome::Skipped;
        }

        let Some(trip_id) = notification.partition_key.as_deref() else {
            warn!(sort_key = ?notification.sort_key, "change notification without partition key");
            return ListenerOutcome::Skipped;
        };

        let rows = match self.store.query_partition(trip_id).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(trip_id, "failed to query trip rows: {}", e);
                return ListenerOutcome::QueryFailed;
            }
        };

        let mut start = None;
        let mut end = None;
        for event in rows.iter().filter_map(RawTripEvent::from_item) {
            match event.phase {
                Phase::Start if start.is_none() => start = Some(event),
                Phase::End if end.is_none() => end = Some(event),
                _ => {}
            }
        }

        let (Some(start), Some(end)) = (start, end) else {
            debug!(trip_id, "trip not complete yet");
            return ListenerOutcome::Incomplete;
        };

        let trip = CompletedTrip::from_phases(&start, &end, self.timesource.current_time());
        ListenerOutcome::Completed(self.completion.complete(&trip).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_change_kind() {
        assert_eq!("INSERT".parse::<ChangeKind>(), Ok(ChangeKind::Insert));
        assert_eq!("MODIFY".parse::<ChangeKind>(), Ok(ChangeKind::Modify));
        assert_eq!("REMOVE".parse::<ChangeKind>(), Ok(ChangeKind::Remove));
        assert!("insert".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ListenerOutcome::Incomplete.label(), "incomplete");
        assert_eq!(
            ListenerOutcome::Completed(CompletionOutcome::TriggerFailed).label(),
            "trigger_failed"
        );
    }
}
