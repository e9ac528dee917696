/// Configuration management for the relay
///
/// Loads configuration from environment variables.
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::change::{ChangeOperation, PrimaryKeyColumn, PrimaryKeyMap};
use crate::consumer::OperationFilter;
use crate::formatter::Formatter;
use crate::parser::OutputPlugin;

/// Main relay configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Replication source settings
    pub replication: ReplicationConfig,
    /// Parsing, filtering and formatting settings
    pub pipeline: PipelineConfig,
    /// Kafka settings
    pub kafka: KafkaConfig,
    /// Address for the Prometheus endpoint, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
}

/// Replication source settings
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Database URL
    pub database_url: String,
    /// Logical replication slot name
    pub slot: String,
    /// Create the slot if it does not exist
    pub create_slot: bool,
    /// Changes requested per poll
    pub batch_size: i64,
    /// Sleep between polls when no new changes arrived
    pub poll_interval: Duration,
}

/// Parsing, filtering and formatting settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub output_plugin: OutputPlugin,
    pub formatter: Formatter,
    /// Forward complete column sets instead of primary keys (wal2json only)
    pub full_change: bool,
    /// Tables not matching this regex are skipped
    pub table_pattern: Option<String>,
    /// Static primary keys, merged over the ones read from the catalog
    pub primary_keys: PrimaryKeyMap,
    pub operation_filter: OperationFilter,
}

/// Kafka settings
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    pub brokers: String,
    pub topic: String,
    /// Timeout for Kafka send operations
    pub delivery_timeout: Duration,
}

// Default values
fn default_slot() -> String {
    "wal_relay".to_string()
}

fn default_batch_size() -> i64 {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_kafka_timeout_ms() -> u64 {
    5000
}

impl RelayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let replication = ReplicationConfig {
            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable not set")?,
            slot: std::env::var("REPLICATION_SLOT").unwrap_or_else(|_| default_slot()),
            create_slot: env_flag("CREATE_SLOT")?,
            batch_size: std::env::var("POLL_BATCH_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or_else(default_batch_size),
            poll_interval: Duration::from_millis(
                std::env::var("POLL_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_poll_interval_ms),
            ),
        };

        let include = std::env::var("INCLUDE_OPERATIONS").ok();
        let exclude = std::env::var("EXCLUDE_OPERATIONS").ok();
        let operation_filter = match (include, exclude) {
            (Some(_), Some(_)) => {
                bail!("INCLUDE_OPERATIONS and EXCLUDE_OPERATIONS are mutually exclusive")
            }
            (Some(ops), None) => OperationFilter::include(parse_operations(&ops)),
            (None, Some(ops)) => OperationFilter::exclude(parse_operations(&ops)),
            (None, None) => OperationFilter::default(),
        };

        let pipeline = PipelineConfig {
            output_plugin: std::env::var("OUTPUT_PLUGIN")
                .unwrap_or_else(|_| "test_decoding".to_string())
                .parse::<OutputPlugin>()
                .context("Invalid OUTPUT_PLUGIN")?,
            formatter: std::env::var("MESSAGE_FORMATTER")
                .unwrap_or_else(|_| "CSV".to_string())
                .parse::<Formatter>()
                .context("Invalid MESSAGE_FORMATTER")?,
            full_change: env_flag("FULL_CHANGE")?,
            table_pattern: std::env::var("TABLE_PATTERN")
                .ok()
                .filter(|s| !s.is_empty()),
            primary_keys: match std::env::var("PRIMARY_KEY_MAP") {
                Ok(raw) => parse_primary_key_map(&raw).context("Invalid PRIMARY_KEY_MAP")?,
                Err(_) => PrimaryKeyMap::new(),
            },
            operation_filter,
        };

        let kafka = KafkaConfig {
            brokers: std::env::var("KAFKA_BROKERS")
                .unwrap_or_else(|_| "localhost:9092".to_string()),
            topic: std::env::var("KAFKA_TOPIC").unwrap_or_else(|_| "wal-relay.cdc".to_string()),
            delivery_timeout: Duration::from_millis(
                std::env::var("KAFKA_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_else(default_kafka_timeout_ms),
            ),
        };

        let metrics_addr = match std::env::var("METRICS_ADDR") {
            Ok(addr) if !addr.trim().is_empty() => {
                Some(addr.trim().parse().context("Invalid METRICS_ADDR")?)
            }
            _ => None,
        };

        let config = RelayConfig {
            replication,
            pipeline,
            kafka,
            metrics_addr,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work together.
    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.full_change && pipeline.output_plugin != OutputPlugin::Wal2Json {
            bail!("FULL_CHANGE requires the wal2json output plugin");
        }
        if pipeline.full_change && !pipeline.formatter.supports_full_change() {
            bail!(
                "FULL_CHANGE cannot be encoded with the {} formatter, use CSVPayload",
                pipeline.formatter
            );
        }
        if self.replication.batch_size <= 0 {
            bail!("POLL_BATCH_SIZE must be positive");
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> Result<bool> {
    match std::env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("{} must be a boolean, got {:?}", name, other),
        },
        Err(_) => Ok(false),
    }
}

fn parse_operations(raw: &str) -> Vec<ChangeOperation> {
    raw.split(',')
        .map(str::trim)
        .filter(|op| !op.is_empty())
        .map(ChangeOperation::from)
        .collect()
}

/// Parse `schema.table=column[type];schema.table=column[type]`.
pub fn parse_primary_key_map(raw: &str) -> Result<PrimaryKeyMap> {
    let mut keys = PrimaryKeyMap::new();
    for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (table, column) = entry
            .split_once('=')
            .with_context(|| format!("missing '=' in {:?}", entry))?;
        let (column_name, column_type) = column
            .trim()
            .strip_suffix(']')
            .and_then(|c| c.split_once('['))
            .with_context(|| format!("expected column[type] in {:?}", entry))?;

        let table = table.trim();
        if table.is_empty() || column_name.trim().is_empty() || column_type.trim().is_empty() {
            bail!("incomplete primary key entry {:?}", entry);
        }
        keys.insert(
            table.to_string(),
            PrimaryKeyColumn::new(column_name.trim(), column_type.trim()),
        );
    }
    Ok(keys)
}
