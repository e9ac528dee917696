//! Consume loop body: one raw replication event in, published messages and
//! at most one acknowledgment out.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: the replication position of an event is acknowledged
//!   once any of its messages was durably accepted by the publisher. Other
//!   messages of the same event may have been filtered or rejected; after a
//!   restart the whole event can be redelivered.
//! - **No ack without delivery**: an event whose messages were all filtered
//!   out or rejected is never acknowledged.
//! - **Ordering**: messages are published one at a time in parser order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::change::{ChangeOperation, EncodedMessage};
use crate::error::RelayResult;
use crate::event::{Lsn, ReplicationEvent};
use crate::formatter::Formatter;
use crate::metrics::RelayMetrics;
use crate::parser::RecordParser;
use crate::publisher::Publisher;

/// Width of a send window in seconds.
pub const WINDOW_SECONDS: i64 = 10;

/// Reports replication progress back to the source.
///
/// Implementations must tolerate repeated positions; the consumer never
/// reports a position lower than one it already reported.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn acknowledge(&self, position: Lsn) -> RelayResult<()>;
}

/// Source of wall-clock time for window accounting.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch
    fn unix_seconds(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// Event and byte counts for the current 10 second bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendWindow {
    pub bucket_start: i64,
    pub message_count: u64,
    pub byte_size: u64,
}

impl SendWindow {
    pub fn new(now: i64) -> Self {
        Self {
            bucket_start: Self::bucket_for(now),
            message_count: 0,
            byte_size: 0,
        }
    }

    pub fn bucket_for(now: i64) -> i64 {
        now.div_euclid(WINDOW_SECONDS) * WINDOW_SECONDS
    }

    /// Account one event, rotating first if `now` falls into a new bucket.
    ///
    /// Returns the window that was closed by the rotation, if any.
    pub fn record(&mut self, now: i64, size: u64) -> Option<SendWindow> {
        let bucket = Self::bucket_for(now);
        let closed = if bucket != self.bucket_start {
            let closed = *self;
            *self = Self {
                bucket_start: bucket,
                message_count: 0,
                byte_size: 0,
            };
            Some(closed)
        } else {
            None
        };

        self.message_count += 1;
        self.byte_size += size;
        closed
    }
}

/// Which operations are forwarded to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationFilter {
    Include(HashSet<ChangeOperation>),
    Exclude(HashSet<ChangeOperation>),
}

impl OperationFilter {
    pub fn include<I: IntoIterator<Item = ChangeOperation>>(operations: I) -> Self {
        Self::Include(operations.into_iter().collect())
    }

    pub fn exclude<I: IntoIterator<Item = ChangeOperation>>(operations: I) -> Self {
        Self::Exclude(operations.into_iter().collect())
    }

    pub fn allows(&self, operation: &ChangeOperation) -> bool {
        match self {
            Self::Include(operations) => operations.contains(operation),
            Self::Exclude(operations) => !operations.contains(operation),
        }
    }
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self::include(ChangeOperation::defaults())
    }
}

/// What one consume cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOutcome {
    /// Changes produced by the parser
    pub records: usize,
    /// Messages the publisher accepted
    pub published: usize,
    /// Messages the publisher did not accept
    pub rejected: usize,
    /// Messages dropped by the operation filter
    pub filtered: usize,
    pub acknowledged: bool,
}

/// Drives parsing, publishing and acknowledgment for each replication event.
pub struct Consumer<P: Publisher> {
    parser: RecordParser,
    formatter: Formatter,
    publisher: Arc<P>,
    filter: OperationFilter,
    clock: Box<dyn Clock>,
    window: SendWindow,
    last_acknowledged: Option<Lsn>,
    metrics: Option<RelayMetrics>,
}

impl<P: Publisher> Consumer<P> {
    pub fn new(
        parser: RecordParser,
        formatter: Formatter,
        publisher: Arc<P>,
        filter: OperationFilter,
    ) -> Self {
        Self::with_clock(parser, formatter, publisher, filter, Box::new(SystemClock))
    }

    pub fn with_clock(
        parser: RecordParser,
        formatter: Formatter,
        publisher: Arc<P>,
        filter: OperationFilter,
        clock: Box<dyn Clock>,
    ) -> Self {
        let window = SendWindow::new(clock.unix_seconds());
        Self {
            parser,
            formatter,
            publisher,
            filter,
            clock,
            window,
            last_acknowledged: None,
            metrics: None,
        }
    }

    /// Also update Prometheus metrics on each cycle.
    pub fn with_metrics(mut self, metrics: RelayMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub fn last_acknowledged(&self) -> Option<Lsn> {
        self.last_acknowledged
    }

    pub fn parser(&self) -> &RecordParser {
        &self.parser
    }

    /// Process one raw replication event.
    ///
    /// # Errors
    ///
    /// Parse and encode errors abort the cycle before anything is published.
    /// They mean the configuration no longer matches the database and the
    /// caller must stop consuming. Acknowledger failures are returned as is,
    /// after the event was accounted in the window and metrics.
    pub async fn consume<A>(
        &mut self,
        event: &ReplicationEvent,
        acknowledger: &A,
    ) -> RelayResult<ConsumeOutcome>
    where
        A: Acknowledger + ?Sized,
    {
        let changes = self.parser.parse(&event.payload)?;
        let mut outcome = ConsumeOutcome {
            records: changes.len(),
            ..ConsumeOutcome::default()
        };

        let messages = changes
            .into_iter()
            .map(|change| self.formatter.encode(change))
            .collect::<RelayResult<Vec<EncodedMessage>>>()?;

        for message in &messages {
            let operation = message.change.operation();
            if !self.filter.allows(&operation) {
                debug!(operation = %operation, "Message filtered by operation");
                outcome.filtered += 1;
                continue;
            }

            if self.publisher.put(message).await {
                outcome.published += 1;
            } else {
                debug!(
                    xid = %message.change.xid(),
                    table = %message.change.table(),
                    "Message not accepted by publisher"
                );
                outcome.rejected += 1;
            }
        }

        let acknowledged = if outcome.published > 0 {
            self.acknowledge(event.data_start, acknowledger).await
        } else {
            Ok(false)
        };
        outcome.acknowledged = matches!(acknowledged, Ok(true));

        // Published messages count even when the acknowledgment fails
        self.account(event);
        self.record_metrics(&outcome);
        acknowledged?;

        debug!(
            lsn = %event.data_start,
            xid = %self.parser.current_xid(),
            records = outcome.records,
            published = outcome.published,
            acknowledged = outcome.acknowledged,
            "Consumed replication event"
        );

        Ok(outcome)
    }

    async fn acknowledge<A>(&mut self, position: Lsn, acknowledger: &A) -> RelayResult<bool>
    where
        A: Acknowledger + ?Sized,
    {
        if let Some(last) = self.last_acknowledged {
            if position < last {
                warn!(
                    position = %position,
                    last_acknowledged = %last,
                    "Skipping acknowledgment behind last acknowledged position"
                );
                return Ok(false);
            }
        }

        acknowledger.acknowledge(position).await?;
        self.last_acknowledged = Some(position);
        Ok(true)
    }

    fn account(&mut self, event: &ReplicationEvent) {
        let now = self.clock.unix_seconds();
        if let Some(closed) = self.window.record(now, event.data_size) {
            if closed.message_count > 0 {
                info!(
                    window_start = closed.bucket_start,
                    messages = closed.message_count,
                    bytes = closed.byte_size,
                    "Send window closed"
                );
            }
        }
    }

    fn record_metrics(&self, outcome: &ConsumeOutcome) {
        let Some(metrics) = &self.metrics else {
            return;
        };

        metrics.events_consumed.inc();
        metrics.messages_published.inc_by(outcome.published as u64);
        metrics.messages_rejected.inc_by(outcome.rejected as u64);
        metrics.messages_filtered.inc_by(outcome.filtered as u64);
        if outcome.acknowledged {
            metrics.acknowledgments.inc();
        }
        metrics.window_messages.set(self.window.message_count as i64);
        metrics.window_bytes.set(self.window.byte_size as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_resets_only_on_new_bucket() {
        let mut window = SendWindow::new(10);
        assert_eq!(window.bucket_start, 10);

        assert!(window.record(11, 100).is_none());
        assert_eq!((window.bucket_start, window.message_count, window.byte_size), (10, 1, 100));

        assert!(window.record(11, 100).is_none());
        assert_eq!((window.message_count, window.byte_size), (2, 200));

        let closed = window.record(20, 100).unwrap();
        assert_eq!((closed.bucket_start, closed.message_count, closed.byte_size), (10, 2, 200));
        assert_eq!((window.bucket_start, window.message_count, window.byte_size), (20, 1, 100));

        assert!(window.record(29, 50).is_none());
        assert_eq!((window.message_count, window.byte_size), (2, 150));
    }

    #[test]
    fn test_bucket_floor() {
        assert_eq!(SendWindow::bucket_for(0), 0);
        assert_eq!(SendWindow::bucket_for(19), 10);
        assert_eq!(SendWindow::bucket_for(1_700_000_005), 1_700_000_000);
    }

    #[test]
    fn test_operation_filter() {
        let include = OperationFilter::include([ChangeOperation::Delete]);
        assert!(include.allows(&ChangeOperation::Delete));
        assert!(!include.allows(&ChangeOperation::Insert));

        let exclude = OperationFilter::exclude([ChangeOperation::Delete]);
        assert!(!exclude.allows(&ChangeOperation::Delete));
        assert!(exclude.allows(&ChangeOperation::Insert));

        let default = OperationFilter::default();
        assert!(default.allows(&ChangeOperation::Truncate));
        assert!(!default.allows(&ChangeOperation::Other("message".to_string())));
    }
}
