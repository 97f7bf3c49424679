use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use trip_common::attributes::{AttributeValue, Attributes};
use trip_common::store::MemoryTripStore;
use trip_common::time::FixedTime;
use trip_common::trip::{ItemKey, Phase, RawTripEvent, TableItem};
use trip_joiner::completion::{CompletionOutcome, CompletionWriteMode, CompletionWriter};
use trip_joiner::listener::{ChangeKind, ChangeListener, ChangeNotification, ListenerOutcome};
use trip_joiner::trigger::{ExecutionHandle, TriggerError, WorkflowTrigger};
use trip_joiner::worker::handle_notifications;

const COMPLETED_AT: &str = "2024-01-01T12:00:00Z";

/// Records every trip it is asked to start.
#[derive(Default)]
struct RecordingTrigger {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingTrigger {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowTrigger for RecordingTrigger {
    async fn start(&self, trip_id: &str) -> Result<ExecutionHandle, TriggerError> {
        let mut calls = self.calls.lock().unwrap();
        calls.push(trip_id.to_owned());
        if self.fail {
            return Err(TriggerError::StatusError {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".to_owned(),
            });
        }
        Ok(ExecutionHandle {
            execution_id: format!("exec-{}-{}", trip_id, calls.len()),
        })
    }
}

struct Harness {
    store: MemoryTripStore,
    trigger: Arc<RecordingTrigger>,
    listener: ChangeListener,
}

fn harness_with(trigger: RecordingTrigger, mode: CompletionWriteMode) -> Harness {
    let store = MemoryTripStore::default();
    let trigger = Arc::new(trigger);
    let completion = CompletionWriter::new(Arc::new(store.clone()), trigger.clone(), mode);
    let listener = ChangeListener::new(
        Arc::new(store.clone()),
        completion,
        Arc::new(FixedTime {
            time: COMPLETED_AT.to_owned(),
        }),
    );

    Harness {
        store,
        trigger,
        listener,
    }
}

fn harness() -> Harness {
    harness_with(RecordingTrigger::default(), CompletionWriteMode::Overwrite)
}

fn raw_start(trip_id: &str, pickup: &str) -> TableItem {
    let mut attributes = Attributes::new();
    attributes.insert("pickup_datetime".to_owned(), pickup.into());
    attributes.insert("pickup_location".to_owned(), "Midtown".into());
    RawTripEvent {
        trip_id: trip_id.to_owned(),
        phase: Phase::Start,
        event_timestamp: pickup.to_owned(),
        attributes,
        ingestion_timestamp: "2024-01-01T11:59:00Z".to_owned(),
    }
    .to_item()
}

fn raw_end(trip_id: &str, dropoff: &str, fare: &str) -> TableItem {
    let mut attributes = Attributes::new();
    attributes.insert("dropoff_datetime".to_owned(), dropoff.into());
    attributes.insert(
        "fare_amount".to_owned(),
        AttributeValue::Number(Decimal::from_str(fare).unwrap()),
    );
    RawTripEvent {
        trip_id: trip_id.to_owned(),
        phase: Phase::End,
        event_timestamp: dropoff.to_owned(),
        attributes,
        ingestion_timestamp: "2024-01-01T11:59:00Z".to_owned(),
    }
    .to_item()
}

/// Store a raw row and return the notification its insert produces.
fn arrive(store: &MemoryTripStore, item: TableItem) -> ChangeNotification {
    let notification = ChangeNotification::insert(&item.key.partition_key, &item.key.sort_key);
    store.insert(item);
    notification
}

fn completed_key(trip_id: &str, pickup: &str) -> ItemKey {
    ItemKey {
        partition_key: trip_id.to_owned(),
        sort_key: format!("COMPLETED#{pickup}"),
    }
}

fn completed_rows(store: &MemoryTripStore) -> Vec<TableItem> {
    store
        .items()
        .into_iter()
        .filter(|item| item.key.sort_key.starts_with("COMPLETED#"))
        .collect()
}

#[tokio::test]
async fn it_joins_a_trip_once_both_phases_arrived() {
    let h = harness();

    let first = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    assert_eq!(h.listener.handle(&first).await, ListenerOutcome::Incomplete);
    assert!(h.trigger.calls().is_empty());

    let second = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));
    let outcome = h.listener.handle(&second).await;

    assert_eq!(
        outcome,
        ListenerOutcome::Completed(CompletionOutcome::Triggered(ExecutionHandle {
            execution_id: "exec-T1-1".to_owned()
        }))
    );
    assert_eq!(h.trigger.calls(), vec!["T1".to_owned()]);

    let completed = h
        .store
        .get(&completed_key("T1", "2024-01-01T10:00:00"))
        .expect("completed row written");
    assert_eq!(completed.attribute_str("status"), Some("completed"));
    assert_eq!(completed.attribute_str("trip_id"), Some("T1"));
    assert_eq!(
        completed.attribute_str("dropoff_datetime"),
        Some("2024-01-01T10:20:00")
    );
    assert_eq!(completed.attribute_str("pickup_location"), Some("Midtown"));
    assert_eq!(
        completed.attributes.get("fare"),
        Some(&AttributeValue::Number(Decimal::from_str("12.5").unwrap()))
    );
    assert_eq!(completed.attributes.get("distance"), Some(&AttributeValue::Null));
    assert_eq!(
        completed.attribute_str("completion_timestamp"),
        Some(COMPLETED_AT)
    );
}

#[tokio::test]
async fn it_joins_the_same_way_when_the_end_arrives_first() {
    let h = harness();

    let first = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));
    assert_eq!(h.listener.handle(&first).await, ListenerOutcome::Incomplete);

    let second = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    assert!(matches!(
        h.listener.handle(&second).await,
        ListenerOutcome::Completed(CompletionOutcome::Triggered(_))
    ));

    let rows = completed_rows(&h.store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, completed_key("T1", "2024-01-01T10:00:00"));
    assert_eq!(h.trigger.calls(), vec!["T1".to_owned()]);
}

#[tokio::test]
async fn it_never_completes_a_trip_with_only_a_start() {
    let h = harness();

    let notification = arrive(&h.store, raw_start("T2", "2024-01-01T10:00:00"));
    assert_eq!(h.listener.handle(&notification).await, ListenerOutcome::Incomplete);
    // Replays do not change anything.
    assert_eq!(h.listener.handle(&notification).await, ListenerOutcome::Incomplete);

    assert!(completed_rows(&h.store).is_empty());
    assert!(h.trigger.calls().is_empty());
}

#[tokio::test]
async fn it_ignores_changes_that_cannot_complete_a_trip() {
    let h = harness();
    h.store.insert(raw_start("T1", "2024-01-01T10:00:00"));
    h.store.insert(raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    let modify = ChangeNotification {
        event_name: ChangeKind::Modify,
        ..ChangeNotification::insert("T1", "RAW#trip_end#2024-01-01T10:20:00")
    };
    let completed = ChangeNotification::insert("T1", "COMPLETED#2024-01-01T10:00:00");
    let no_partition = ChangeNotification {
        partition_key: None,
        ..ChangeNotification::insert("T1", "RAW#trip_end#2024-01-01T10:20:00")
    };

    for notification in [modify, completed, no_partition] {
        assert_eq!(h.listener.handle(&notification).await, ListenerOutcome::Skipped);
    }
    assert!(h.trigger.calls().is_empty());
    assert_eq!(h.store.put_count(), 0);
}

#[tokio::test]
async fn it_skips_the_trip_when_the_query_fails() {
    let h = harness();
    let _start = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));
    h.store.fail_queries(true);

    assert_eq!(h.listener.handle(&end).await, ListenerOutcome::QueryFailed);
    assert!(h.trigger.calls().is_empty());
}

#[tokio::test]
async fn it_does_not_trigger_when_the_completed_row_cannot_be_written() {
    let h = harness();
    let _start = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));
    h.store.fail_puts(true);

    assert_eq!(
        h.listener.handle(&end).await,
        ListenerOutcome::Completed(CompletionOutcome::PersistFailed)
    );
    assert!(h.trigger.calls().is_empty());
    assert!(completed_rows(&h.store).is_empty());
}

#[tokio::test]
async fn it_keeps_the_completed_row_when_the_trigger_fails() {
    let h = harness_with(RecordingTrigger::failing(), CompletionWriteMode::Overwrite);
    let _start = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    assert_eq!(
        h.listener.handle(&end).await,
        ListenerOutcome::Completed(CompletionOutcome::TriggerFailed)
    );
    assert_eq!(h.trigger.calls().len(), 1);
    assert_eq!(completed_rows(&h.store).len(), 1);
}

#[tokio::test]
async fn it_triggers_again_on_a_redelivered_notification() {
    let h = harness();
    let _start = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    h.listener.handle(&end).await;
    h.listener.handle(&end).await;

    assert_eq!(h.trigger.calls(), vec!["T1".to_owned(), "T1".to_owned()]);
    assert_eq!(completed_rows(&h.store).len(), 1);
    assert_eq!(h.store.put_count(), 2);
}

#[tokio::test]
async fn it_triggers_once_when_writing_only_absent_completions() {
    let h = harness_with(RecordingTrigger::default(), CompletionWriteMode::IfAbsent);
    let _start = arrive(&h.store, raw_start("T1", "2024-01-01T10:00:00"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    assert!(matches!(
        h.listener.handle(&end).await,
        ListenerOutcome::Completed(CompletionOutcome::Triggered(_))
    ));
    assert_eq!(
        h.listener.handle(&end).await,
        ListenerOutcome::Completed(CompletionOutcome::AlreadyCompleted)
    );
    assert_eq!(h.trigger.calls(), vec!["T1".to_owned()]);
}

#[tokio::test]
async fn it_joins_the_first_row_of_each_phase_in_sort_key_order() {
    let h = harness();
    h.store.insert(raw_start("T1", "2024-01-01T10:05:00"));
    h.store.insert(raw_start("T1", "2024-01-01T10:00:00"));
    h.store.insert(raw_end("T1", "2024-01-01T10:30:00", "20"));
    let end = arrive(&h.store, raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    h.listener.handle(&end).await;

    let rows = completed_rows(&h.store);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].key, completed_key("T1", "2024-01-01T10:00:00"));
    assert_eq!(
        rows[0].attribute_str("dropoff_datetime"),
        Some("2024-01-01T10:20:00")
    );
}

#[tokio::test]
async fn it_handles_a_claimed_batch_concurrently() {
    let h = harness();
    let mut notifications = Vec::new();
    for i in 0..10 {
        let trip_id = format!("T{i}");
        notifications.push(arrive(&h.store, raw_start(&trip_id, "2024-01-01T10:00:00")));
        notifications.push(arrive(
            &h.store,
            raw_end(&trip_id, "2024-01-01T10:20:00", "9.75"),
        ));
    }
    notifications.push(ChangeNotification::insert("T99", "RAW#trip_start#2024-01-01T10:00:00"));

    let outcomes =
        handle_notifications(&h.listener, &Arc::new(Semaphore::new(3)), notifications).await;

    assert_eq!(outcomes.len(), 21);
    assert_eq!(completed_rows(&h.store).len(), 10);
    let mut triggered = h.trigger.calls();
    triggered.sort();
    triggered.dedup();
    assert_eq!(triggered.len(), 10);
    assert!(outcomes.contains(&ListenerOutcome::Incomplete));
}

#[tokio::test]
async fn it_joins_on_the_partition_when_the_sort_key_is_missing() {
    let h = harness();
    h.store.insert(raw_start("T1", "2024-01-01T10:00:00"));
    h.store.insert(raw_end("T1", "2024-01-01T10:20:00", "12.5"));

    let notification = ChangeNotification {
        sort_key: None,
        ..ChangeNotification::insert("T1", "RAW#trip_end#2024-01-01T10:20:00")
    };

    assert!(matches!(
        h.listener.handle(&notification).await,
        ListenerOutcome::Completed(CompletionOutcome::Triggered(_))
    ));
    assert_eq!(h.trigger.calls(), vec!["T1".to_owned()]);
}
