//! Consume trip events from Kafka and persist them as raw rows in the trip table.
use std::sync::Arc;

use anyhow::Context;
use envconfig::Envconfig;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use trip_common::health::HealthRegistry;
use trip_common::metrics::{serve, setup_metrics_router};
use trip_common::store::PgTripStore;
use trip_common::time::SystemTime;
use trip_ingest::config::Config;
use trip_ingest::consumer::StreamBatchConsumer;
use trip_ingest::handler::IngestHandler;
use trip_ingest::writer::RawStoreWriter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);
    tracing_subscriber::registry().with(log_layer).init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let consumer_liveness = liveness.register(
        "kafka_consumer",
        time::Duration::milliseconds(config.batch_timeout.0.as_millis() as i64) * 30,
    );

    let store = PgTripStore::new(
        config.store.trip_table_name.as_str(),
        &config.store.database_url,
        config.store.max_pg_connections,
    )
    .context("failed to configure the trip store")?;

    let writer = RawStoreWriter::new(Arc::new(store), config.retry_policy.provide());
    let handler = IngestHandler::new(writer, Arc::new(SystemTime {}));
    let consumer = StreamBatchConsumer::new(&config.kafka).context("failed to create consumer")?;

    let bind = config.bind();
    let router = setup_metrics_router(liveness).context("failed to install metrics recorder")?;
    tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("failed to serve metrics: {}", e);
        }
    });

    info!(
        table = config.store.trip_table_name.as_str(),
        topic = %config.kafka.kafka_consumer_topic,
        "starting trip ingestion"
    );

    loop {
        consumer_liveness.report_healthy();

        let mut batch = match consumer
            .next_batch(config.batch_size, config.batch_timeout.0)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!("failed to receive from Kafka: {}", e);
                tokio::time::sleep(config.batch_timeout.0).await;
                continue;
            }
        };
        if batch.is_empty() {
            continue;
        }

        // A missing table cannot fix itself, so the process exits without storing offsets.
        handler.handle_batch(batch.take_entries()).await?;

        consumer.commit(batch)?;
    }
}
