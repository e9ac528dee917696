//! Replication source backed by SQL-level logical decoding functions.
//!
//! Changes are read with `pg_logical_slot_peek_changes` and the slot is only
//! moved forward with `pg_replication_slot_advance` when the consumer
//! acknowledges a position. Until then every poll sees the unacknowledged
//! changes again; the reader remembers what it already handed out and skips
//! those rows.
//!
//! Requires PostgreSQL 11 or later and a role with the REPLICATION attribute.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::change::{PrimaryKeyColumn, PrimaryKeyMap};
use crate::config::ReplicationConfig;
use crate::consumer::{Acknowledger, Consumer};
use crate::error::{RelayError, RelayResult};
use crate::event::{Lsn, ReplicationEvent};
use crate::metrics::RelayMetrics;
use crate::parser::OutputPlugin;
use crate::publisher::Publisher;

/// Rows of one poll are re-read more than this many batches over before
/// the reader warns about the unacknowledged backlog.
const REREAD_WARN_BATCHES: i64 = 10;

/// How far into the commit-ordered change stream the consumer has been fed.
///
/// The slot returns whole transactions in commit order, so a row's LSN says
/// nothing about whether it was handed out: a transaction that began earlier
/// can commit later. Transactions are identified by the LSN of their last
/// row instead, which grows with commit order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ConsumedCursor {
    /// End LSN of the last transaction handed out completely
    committed: Option<Lsn>,
    /// End LSN and handed-out row count of a transaction cut short
    partial: Option<(Lsn, usize)>,
}

impl ConsumedCursor {
    /// Rows at the head of the transaction ending at `end` that were
    /// already handed out.
    fn consumed_rows(&self, end: Lsn, rows: usize) -> usize {
        if self.committed.is_some_and(|committed| end <= committed) {
            return rows;
        }
        match self.partial {
            Some((partial_end, count)) if partial_end == end => count.min(rows),
            _ => 0,
        }
    }

    fn advance(&mut self, event: &PeekedEvent) {
        if event.ends_transaction {
            self.committed = Some(event.transaction_end);
            self.partial = None;
            return;
        }
        self.partial = Some(match self.partial {
            Some((end, count)) if end == event.transaction_end => (end, count + 1),
            _ => (event.transaction_end, 1),
        });
    }
}

/// A replication event together with its place in the change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PeekedEvent {
    event: ReplicationEvent,
    /// LSN of the last row of the enclosing transaction
    transaction_end: Lsn,
    ends_transaction: bool,
}

/// Polls a logical replication slot and acknowledges progress on it.
pub struct SlotReader {
    pool: PgPool,
    slot: String,
    plugin: OutputPlugin,
    batch_size: i64,
    poll_interval: Duration,
    consumed: ConsumedCursor,
    /// Rows skipped by the previous poll, added to the next limit
    skipped: i64,
    metrics: Option<RelayMetrics>,
}

impl SlotReader {
    pub fn new(pool: PgPool, config: &ReplicationConfig, plugin: OutputPlugin) -> Self {
        Self {
            pool,
            slot: config.slot.clone(),
            plugin,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval,
            consumed: ConsumedCursor::default(),
            skipped: 0,
            metrics: None,
        }
    }

    /// Also report the re-read backlog to Prometheus.
    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Make sure the slot exists and decodes with the configured plugin.
    pub async fn ensure_slot(&self, create: bool) -> RelayResult<()> {
        let plugin: Option<Option<String>> =
            sqlx::query_scalar("SELECT plugin::text FROM pg_replication_slots WHERE slot_name = $1")
                .bind(&self.slot)
                .fetch_optional(&self.pool)
                .await?;

        match plugin {
            Some(Some(plugin)) if plugin == self.plugin.as_str() => {
                info!(slot = %self.slot, plugin = %plugin, "Using existing replication slot");
                Ok(())
            }
            Some(plugin) => Err(RelayError::Config(format!(
                "replication slot {} uses plugin {:?}, expected {}",
                self.slot, plugin, self.plugin
            ))),
            None if create => {
                sqlx::query("SELECT pg_create_logical_replication_slot($1, $2)")
                    .bind(&self.slot)
                    .bind(self.plugin.as_str())
                    .execute(&self.pool)
                    .await?;
                info!(slot = %self.slot, plugin = %self.plugin, "Created replication slot");
                Ok(())
            }
            None => Err(RelayError::Config(format!(
                "replication slot {} does not exist",
                self.slot
            ))),
        }
    }

    fn peek_query(&self) -> &'static str {
        match self.plugin {
            OutputPlugin::TestDecoding => {
                "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2)"
            }
            OutputPlugin::Wal2Json => {
                "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, 'include-xids', '1')"
            }
        }
    }

    /// Fetch the changes not yet handed to the consumer.
    async fn poll(&mut self) -> RelayResult<Vec<PeekedEvent>> {
        let limit = i32::try_from(self.batch_size.saturating_add(self.skipped)).unwrap_or(i32::MAX);
        let rows = sqlx::query_as::<_, (String, String)>(self.peek_query())
            .bind(&self.slot)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let (events, skipped) = unconsumed_events(self.plugin, &self.consumed, rows)?;

        self.skipped = skipped;
        if let Some(metrics) = &self.metrics {
            metrics.reread_rows.set(skipped);
        }
        if skipped > self.batch_size.saturating_mul(REREAD_WARN_BATCHES) {
            warn!(
                slot = %self.slot,
                skipped,
                "Large unacknowledged backlog re-read from slot, check the operation filter"
            );
        }
        debug!(
            slot = %self.slot,
            limit,
            skipped,
            new = events.len(),
            "Polled replication slot"
        );
        Ok(events)
    }

    /// Feed every new change to `consumer` until a fatal error occurs.
    ///
    /// Cancel by dropping the future; an event that is mid-cycle is then
    /// redelivered after restart since it was never acknowledged.
    pub async fn run<P: Publisher>(&mut self, consumer: &mut Consumer<P>) -> RelayResult<()> {
        info!(
            slot = %self.slot,
            plugin = %self.plugin,
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Replication reader starting"
        );

        loop {
            let events = self.poll().await?;
            if events.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
                continue;
            }

            for peeked in &events {
                if let Err(e) = consumer.consume(&peeked.event, &*self).await {
                    if e.is_fatal_mapping() {
                        error!(
                            slot = %self.slot,
                            lsn = %peeked.event.data_start,
                            "Primary key map does not match the database schema, stopping"
                        );
                    }
                    return Err(e);
                }
                self.consumed.advance(peeked);
            }
        }
    }
}

#[async_trait]
impl Acknowledger for SlotReader {
    async fn acknowledge(&self, position: Lsn) -> RelayResult<()> {
        // A redelivered event may sit behind the slot's confirmed position,
        // which the server refuses to move back to.
        let advanced: Option<Option<String>> = sqlx::query_scalar(
            r#"
            SELECT (pg_replication_slot_advance(slot_name, GREATEST($2::pg_lsn, confirmed_flush_lsn))).end_lsn::text
            FROM pg_replication_slots
            WHERE slot_name = $1
            "#,
        )
        .bind(&self.slot)
        .bind(position.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match advanced {
            Some(end_lsn) => {
                debug!(
                    slot = %self.slot,
                    position = %position,
                    end_lsn = ?end_lsn,
                    "Replication slot advanced"
                );
                Ok(())
            }
            None => Err(RelayError::Acknowledge(format!(
                "replication slot {} disappeared",
                self.slot
            ))),
        }
    }
}

/// Whether `data` is the last row the plugin emits for a transaction.
fn ends_transaction(plugin: OutputPlugin, data: &str) -> bool {
    match plugin {
        OutputPlugin::TestDecoding => data.starts_with("COMMIT"),
        OutputPlugin::Wal2Json => true,
    }
}

/// Drop the rows of a peek result that were already handed to the consumer.
///
/// Rows are grouped into transactions by their closing row. A trailing
/// transaction without one is held back until a later poll returns it
/// whole. Returns the new events and the number of rows skipped.
fn unconsumed_events(
    plugin: OutputPlugin,
    consumed: &ConsumedCursor,
    rows: Vec<(String, String)>,
) -> RelayResult<(Vec<PeekedEvent>, i64)> {
    let mut events = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    let mut transaction: Vec<(Lsn, String)> = Vec::new();

    for (lsn, data) in rows {
        let lsn: Lsn = lsn.parse()?;
        let closes = ends_transaction(plugin, &data);
        transaction.push((lsn, data));
        if !closes {
            continue;
        }

        let rows = std::mem::take(&mut transaction);
        let last = rows.len() - 1;
        let already = consumed.consumed_rows(lsn, rows.len());
        skipped += already as i64;

        for (index, (row_lsn, data)) in rows.into_iter().enumerate().skip(already) {
            events.push(PeekedEvent {
                event: ReplicationEvent::new(row_lsn, data),
                transaction_end: lsn,
                ends_transaction: index == last,
            });
        }
    }

    if !transaction.is_empty() {
        debug!(
            rows = transaction.len(),
            "Holding back transaction without a closing row"
        );
    }

    Ok((events, skipped))
}

/// Read single-column primary keys of all user tables.
///
/// Table names are rendered the way `plugin` prints them and types the way
/// `format_type` prints them without modifiers. Tables with composite keys
/// are left out and will fail loudly if their changes pass the table filter.
pub async fn load_primary_key_map(
    pool: &PgPool,
    plugin: OutputPlugin,
) -> RelayResult<PrimaryKeyMap> {
    let table_expr = match plugin {
        OutputPlugin::TestDecoding => "quote_ident(n.nspname) || '.' || quote_ident(c.relname)",
        OutputPlugin::Wal2Json => "n.nspname || '.' || c.relname",
    };
    let query = format!(
        r#"
        SELECT {} AS table_name,
               a.attname::text AS column_name,
               format_type(a.atttypid, NULL) AS column_type
        FROM pg_index i
        JOIN pg_class c ON c.oid = i.indrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey)
        WHERE i.indisprimary
          AND n.nspname NOT IN ('pg_catalog', 'information_schema')
          AND n.nspname NOT LIKE 'pg_toast%'
        ORDER BY 1, 2
        "#,
        table_expr
    );

    let rows = sqlx::query_as::<_, (String, String, String)>(&query)
        .fetch_all(pool)
        .await?;

    Ok(single_column_keys(rows))
}

fn single_column_keys(rows: Vec<(String, String, String)>) -> PrimaryKeyMap {
    let mut keys = PrimaryKeyMap::new();
    let mut composite = Vec::new();

    for (table, column_name, column_type) in rows {
        if composite.contains(&table) {
            continue;
        }
        if keys.remove(&table).is_some() {
            composite.push(table);
            continue;
        }
        keys.insert(table, PrimaryKeyColumn::new(column_name, column_type));
    }

    for table in &composite {
        warn!(table = %table, "Skipping table with composite primary key");
    }
    info!(tables = keys.len(), "Loaded primary keys from catalog");
    keys
}
