use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use trip_common::health::{ComponentStatus, HealthHandle};

use crate::changes::PgChangeFeed;
use crate::listener::{ChangeListener, ChangeNotification, ListenerOutcome};

/// Polls the change feed and joins trips as their raw rows arrive.
pub struct JoinWorker {
    feed: PgChangeFeed,
    listener: ChangeListener,
    poll_interval: time::Duration,
    batch_size: i64,
    semaphore: Arc<Semaphore>,
    liveness: HealthHandle,
}

impl JoinWorker {
    pub fn new(
        feed: PgChangeFeed,
        listener: ChangeListener,
        poll_interval: time::Duration,
        batch_size: i64,
        max_concurrent_notifications: usize,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            feed,
            listener,
            poll_interval,
            batch_size,
            semaphore: Arc::new(Semaphore::new(max_concurrent_notifications)),
            liveness,
        }
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;

            let mut batch = match self.feed.claim(self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    metrics::counter!("trip_joiner_claim_errors_total").increment(1);
                    error!("failed to claim change notifications: {}", e);
                    self.liveness.report_status(ComponentStatus::Unhealthy);
                    continue;
                }
            };
            self.liveness.report_healthy();

            if batch.is_empty() {
                continue;
            }

            let claimed = batch.len();
            metrics::histogram!("trip_joiner_claimed_notifications").record(claimed as f64);

            let notifications = std::mem::take(&mut batch.notifications);
            handle_notifications(&self.listener, &self.semaphore, notifications).await;

            // Acked only after every notification was handled, so a crash redelivers the batch.
            match batch.ack().await {
                Ok(()) => debug!(claimed, "change notifications acked"),
                Err(e) => error!(claimed, "failed to ack change notifications: {}", e),
            }
        }
    }
}

/// Handle each notification in its own task, at most as many at once as the semaphore allows.
/// Returns the outcomes in completion order.
pub async fn handle_notifications(
    listener: &ChangeListener,
    semaphore: &Arc<Semaphore>,
    notifications: Vec<ChangeNotification>,
) -> Vec<ListenerOutcome> {
    let mut tasks = JoinSet::new();
    for notification in notifications {
        let listener = listener.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let permit = semaphore.acquire_owned().await;
            let outcome = listener.handle(&notification).await;
            drop(permit);
            outcome
        });
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(outcome) => {
                metrics::counter!("trip_joiner_notifications_total", &[("outcome", outcome.label())])
                    .increment(1);
                if let ListenerOutcome::Completed(completion) = &outcome {
                    info!(outcome = completion.label(), "trip joined");
                }
                outcomes.push(outcome);
            }
            Err(e) => error!("notification task failed: {}", e),
        }
    }

    outcomes
}
