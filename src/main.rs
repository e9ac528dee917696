use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use wal_relay::config::RelayConfig;
use wal_relay::metrics::{serve_metrics, RelayMetrics};
use wal_relay::replication::{load_primary_key_map, SlotReader};
use wal_relay::{Consumer, KafkaPublisher, PrimaryKeyMap, RecordParser};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,wal_relay=debug".into()),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(tracing_subscriber::fmt::layer))
        .init();

    let config = RelayConfig::from_env().context("Failed to load configuration")?;
    let pipeline = &config.pipeline;

    tracing::info!(
        slot = %config.replication.slot,
        plugin = %pipeline.output_plugin,
        formatter = %pipeline.formatter,
        full_change = pipeline.full_change,
        topic = %config.kafka.topic,
        "Starting wal-relay"
    );

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&config.replication.database_url)
        .await
        .context("Failed to connect to database")?;

    let metrics = RelayMetrics::new(&config.replication.slot);
    if let Some(addr) = config.metrics_addr {
        tokio::spawn(async move {
            if let Err(e) = serve_metrics(addr).await {
                tracing::error!(error = %e, "Metrics endpoint stopped");
            }
        });
    }

    let mut reader = SlotReader::new(pool.clone(), &config.replication, pipeline.output_plugin)
        .with_metrics(metrics.clone());
    reader
        .ensure_slot(config.replication.create_slot)
        .await
        .context("Failed to prepare replication slot")?;

    let mut primary_keys = if pipeline.full_change {
        PrimaryKeyMap::new()
    } else {
        load_primary_key_map(&pool, pipeline.output_plugin)
            .await
            .context("Failed to load primary keys")?
    };
    primary_keys.extend(pipeline.primary_keys.clone());

    let parser = RecordParser::for_output_plugin(
        pipeline.output_plugin,
        primary_keys,
        pipeline.full_change,
        pipeline.table_pattern.as_deref(),
    )
    .context("Failed to build record parser")?;

    let publisher = Arc::new(
        KafkaPublisher::connect(
            &config.kafka.brokers,
            config.kafka.topic.clone(),
            config.kafka.delivery_timeout,
        )
        .context("Failed to create Kafka publisher")?,
    );

    let mut consumer = Consumer::new(
        parser,
        pipeline.formatter,
        publisher,
        pipeline.operation_filter.clone(),
    )
    .with_metrics(metrics);

    tokio::select! {
        result = reader.run(&mut consumer) => {
            result.context("Replication stopped on fatal error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received, stopping replication");
        }
    }

    Ok(())
}
