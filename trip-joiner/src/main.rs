//! Join raw trip rows into completed trips and start their workflow.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use trip_common::health::HealthRegistry;
use trip_common::metrics::{serve, setup_metrics_router};
use trip_common::store::PgTripStore;
use trip_common::time::SystemTime;
use trip_joiner::changes::PgChangeFeed;
use trip_joiner::completion::CompletionWriter;
use trip_joiner::config::Config;
use trip_joiner::listener::ChangeListener;
use trip_joiner::trigger::HttpWorkflowTrigger;
use trip_joiner::worker::JoinWorker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness.register("join_worker", time::Duration::seconds(60));

    let table = config.store.trip_table_name.as_str();
    let store = PgTripStore::new(
        table,
        &config.store.database_url,
        config.store.max_pg_connections,
    )
    .context("failed to configure the trip store")?;
    let feed = PgChangeFeed::new(table, store.pool().clone());

    let trigger = HttpWorkflowTrigger::new(
        config.workflow_trigger_url.as_str(),
        config.workflow_id.as_str(),
        config.trigger_timeout.0,
    )
    .context("failed to build the workflow trigger")?;

    let store = Arc::new(store);
    let completion = CompletionWriter::new(
        store.clone(),
        Arc::new(trigger),
        config.completion_write_mode,
    );
    let listener = ChangeListener::new(store, completion, Arc::new(SystemTime {}));

    let worker = JoinWorker::new(
        feed,
        listener,
        config.poll_interval.0,
        config.notification_batch_size,
        config.max_concurrent_notifications,
        worker_liveness,
    );

    let bind = config.bind();
    let router = setup_metrics_router(liveness).context("failed to install metrics recorder")?;
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics: {}", e);
        }
    });

    info!(
        table,
        mode = ?config.completion_write_mode,
        "starting trip joiner"
    );
    worker.run().await;

    Ok(())
}
