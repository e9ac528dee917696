use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, warn};

use crate::change::EncodedMessage;
use crate::error::{RelayError, RelayResult};

/// Hands encoded messages to the partitioned stream.
///
/// `put` returns `true` only when the message is durably accepted and its
/// replication position is safe to acknowledge. `false` covers everything
/// else (buffered, rejected, timed out); retry policy is the publisher's
/// concern and the consumer never inspects why.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn put(&self, message: &EncodedMessage) -> bool;
}

/// Kafka-based implementation of [`Publisher`].
///
/// This publisher:
/// - Uses idempotent producer settings (enable.idempotence=true, acks=all)
/// - Sends every message to a single topic
/// - Uses the change's partition key (primary key) as the record key
/// - Includes xid, table and operation in Kafka headers
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    delivery_timeout: Duration,
}

impl KafkaPublisher {
    /// Create a publisher from an existing producer.
    ///
    /// The producer MUST be configured with `enable.idempotence = true` and
    /// `acks = all`, otherwise a successful send is not durable.
    pub fn new(producer: FutureProducer, topic: String, delivery_timeout: Duration) -> Self {
        Self {
            producer,
            topic,
            delivery_timeout,
        }
    }

    /// Create a publisher with its own idempotent producer.
    pub fn connect(brokers: &str, topic: String, delivery_timeout: Duration) -> RelayResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "5")
            .set("message.timeout.ms", delivery_timeout.as_millis().to_string())
            .create()
            .map_err(|e| RelayError::Config(format!("failed to create Kafka producer: {}", e)))?;

        Ok(Self::new(producer, topic, delivery_timeout))
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn put(&self, message: &EncodedMessage) -> bool {
        let change = &message.change;
        let key = change.partition_key();
        let table = change.table();
        let operation = change.operation();

        let headers = OwnedHeaders::new()
            .insert(Header {
                key: "xid",
                value: Some(change.xid().as_bytes()),
            })
            .insert(Header {
                key: "table",
                value: Some(table.as_bytes()),
            })
            .insert(Header {
                key: "operation",
                value: Some(operation.as_str().as_bytes()),
            });

        let record = FutureRecord::to(&self.topic)
            .key(&key)
            .payload(&message.wire_text)
            .headers(headers);

        match self.producer.send(record, self.delivery_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    topic = %self.topic,
                    partition,
                    offset,
                    table = %table,
                    "Message delivered to Kafka"
                );
                true
            }
            Err((err, _)) => {
                warn!(
                    topic = %self.topic,
                    table = %table,
                    xid = %change.xid(),
                    error = %err,
                    "Kafka delivery failed"
                );
                false
            }
        }
    }
}
