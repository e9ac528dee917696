//! # wal-relay
//!
//! Forwards row-level changes from a PostgreSQL logical replication slot to
//! a Kafka topic, acknowledging slot progress only after delivery.
//!
//! ## Flow
//!
//! 1. The [`replication::SlotReader`] polls the slot and yields one
//!    [`ReplicationEvent`] per decoded message.
//! 2. The [`RecordParser`] for the slot's output plugin (`test_decoding` or
//!    `wal2json`) turns the payload into zero or more [`Change`]s.
//! 3. The [`Formatter`] renders each change as a versioned wire message.
//! 4. The [`Consumer`] drops operations excluded by the [`OperationFilter`],
//!    hands the rest to the [`Publisher`] in order and, if any was accepted,
//!    acknowledges the event's position.
//!
//! This gives **at-least-once delivery**: a position is never acknowledged
//! before at least one message of its event was durably accepted, and events
//! may be redelivered after a restart.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wal_relay::{
//!     Consumer, Formatter, KafkaPublisher, OperationFilter, OutputPlugin, PrimaryKeyColumn,
//!     PrimaryKeyMap, RecordParser, ReplicationEvent,
//! };
//! # use wal_relay::{Acknowledger, Lsn, RelayResult};
//! # struct Noop;
//! # #[async_trait::async_trait]
//! # impl Acknowledger for Noop {
//! #     async fn acknowledge(&self, _: Lsn) -> RelayResult<()> { Ok(()) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut keys = PrimaryKeyMap::new();
//! keys.insert("public.users".to_string(), PrimaryKeyColumn::new("id", "integer"));
//!
//! let parser = RecordParser::for_output_plugin(OutputPlugin::TestDecoding, keys, false, None)?;
//! let publisher = Arc::new(KafkaPublisher::connect(
//!     "localhost:9092",
//!     "wal-relay.cdc".to_string(),
//!     Duration::from_secs(5),
//! )?);
//! let mut consumer = Consumer::new(parser, Formatter::Csv, publisher, OperationFilter::default());
//!
//! consumer.consume(&ReplicationEvent::new(Lsn(100), "BEGIN 7"), &Noop).await?;
//! let outcome = consumer
//!     .consume(&ReplicationEvent::new(Lsn(120), "table public.users: INSERT: id[integer]:1"), &Noop)
//!     .await?;
//! assert_eq!(outcome.records, 1);
//! # Ok(())
//! # }
//! ```

pub mod change;
pub mod config;
pub mod consumer;
mod error;
pub mod event;
pub mod formatter;
pub mod metrics;
pub mod parser;
pub mod publisher;
pub mod replication;

pub use change::{
    Change, ChangeOperation, ChangeRecord, EncodedMessage, FullChangeRecord, PrimaryKeyColumn,
    PrimaryKeyMap,
};
pub use consumer::{
    Acknowledger, Clock, ConsumeOutcome, Consumer, OperationFilter, SendWindow, SystemClock,
};
pub use error::{RelayError, RelayResult};
pub use event::{Lsn, ReplicationEvent};
pub use formatter::{decode_compact, Formatter};
pub use parser::{OutputPlugin, RecordParser};
pub use publisher::{KafkaPublisher, Publisher};
