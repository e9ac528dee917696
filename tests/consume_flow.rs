//! End-to-end tests of the consume cycle with in-memory collaborators.
//!
//! These tests verify:
//! 1. Acknowledgment only after an accepted publish
//! 2. One acknowledgment per event regardless of message count
//! 3. Operation filtering before publishing
//! 4. Send window accounting across bucket boundaries
//! 5. Fatal parse errors abort the cycle without side effects

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use wal_relay::{
    decode_compact, Acknowledger, ChangeOperation, Clock, Consumer, EncodedMessage, Formatter,
    Lsn, OperationFilter, OutputPlugin, PrimaryKeyColumn, PrimaryKeyMap, Publisher,
    RecordParser, RelayError, RelayResult, ReplicationEvent,
};

/// Publisher that records wire texts and answers from a script.
#[derive(Default)]
struct ScriptedPublisher {
    answers: Mutex<VecDeque<bool>>,
    default_answer: bool,
    sent: Mutex<Vec<String>>,
}

impl ScriptedPublisher {
    fn always(answer: bool) -> Arc<Self> {
        Arc::new(Self {
            default_answer: answer,
            ..Self::default()
        })
    }

    fn scripted(answers: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().copied().collect()),
            ..Self::default()
        })
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for ScriptedPublisher {
    async fn put(&self, message: &EncodedMessage) -> bool {
        self.sent.lock().unwrap().push(message.wire_text.clone());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_answer)
    }
}

#[derive(Default)]
struct RecordingAcknowledger {
    positions: Mutex<Vec<Lsn>>,
}

impl RecordingAcknowledger {
    fn positions(&self) -> Vec<Lsn> {
        self.positions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Acknowledger for RecordingAcknowledger {
    async fn acknowledge(&self, position: Lsn) -> RelayResult<()> {
        self.positions.lock().unwrap().push(position);
        Ok(())
    }
}

struct FailingAcknowledger;

#[async_trait]
impl Acknowledger for FailingAcknowledger {
    async fn acknowledge(&self, _position: Lsn) -> RelayResult<()> {
        Err(RelayError::Acknowledge("slot unavailable".to_string()))
    }
}

#[derive(Clone)]
struct ManualClock(Arc<AtomicI64>);

impl ManualClock {
    fn at(seconds: i64) -> Self {
        Self(Arc::new(AtomicI64::new(seconds)))
    }

    fn set(&self, seconds: i64) {
        self.0.store(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn unix_seconds(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

fn primary_keys() -> PrimaryKeyMap {
    let mut keys = PrimaryKeyMap::new();
    keys.insert("public.users".to_string(), PrimaryKeyColumn::new("id", "integer"));
    keys
}

fn test_decoding_consumer(
    publisher: Arc<ScriptedPublisher>,
    filter: OperationFilter,
    clock: ManualClock,
) -> Consumer<ScriptedPublisher> {
    let parser =
        RecordParser::for_output_plugin(OutputPlugin::TestDecoding, primary_keys(), false, None)
            .unwrap();
    Consumer::with_clock(parser, Formatter::Csv, publisher, filter, Box::new(clock))
}

fn wal2json_consumer(
    publisher: Arc<ScriptedPublisher>,
    filter: OperationFilter,
) -> Consumer<ScriptedPublisher> {
    let parser =
        RecordParser::for_output_plugin(OutputPlugin::Wal2Json, primary_keys(), false, None)
            .unwrap();
    Consumer::with_clock(
        parser,
        Formatter::Csv,
        publisher,
        filter,
        Box::new(ManualClock::at(0)),
    )
}

fn user_change(kind: &str, id: i64) -> serde_json::Value {
    json!({
        "kind": kind, "schema": "public", "table": "users",
        "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [id]
    })
}

fn wal2json_event(position: u64, changes: Vec<serde_json::Value>) -> ReplicationEvent {
    ReplicationEvent {
        data_start: Lsn(position),
        data_size: 100,
        payload: json!({"xid": 501, "change": changes}).to_string(),
    }
}

fn table_event(position: u64) -> ReplicationEvent {
    ReplicationEvent {
        data_start: Lsn(position),
        data_size: 100,
        payload: "table public.users: INSERT: id[integer]:12 name[text]:'alice'".to_string(),
    }
}

#[tokio::test]
async fn test_ack_only_after_accepted_publish() {
    let ack = RecordingAcknowledger::default();

    let rejecting = ScriptedPublisher::always(false);
    let mut consumer =
        test_decoding_consumer(rejecting.clone(), OperationFilter::default(), ManualClock::at(0));
    let outcome = consumer.consume(&table_event(10), &ack).await.unwrap();
    assert_eq!(rejecting.sent().len(), 1, "publisher was called");
    assert_eq!(outcome.rejected, 1);
    assert!(!outcome.acknowledged);
    assert!(ack.positions().is_empty(), "no ack for a rejected message");

    let accepting = ScriptedPublisher::always(true);
    let mut consumer =
        test_decoding_consumer(accepting.clone(), OperationFilter::default(), ManualClock::at(0));
    let outcome = consumer.consume(&table_event(10), &ack).await.unwrap();
    assert_eq!(accepting.sent().len(), 1);
    assert!(outcome.acknowledged);
    assert_eq!(ack.positions(), vec![Lsn(10)]);
    assert_eq!(consumer.last_acknowledged(), Some(Lsn(10)));
}

#[tokio::test]
async fn test_transaction_markers_publish_nothing() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer =
        test_decoding_consumer(publisher.clone(), OperationFilter::default(), ManualClock::at(0));

    let begin = consumer
        .consume(&ReplicationEvent::new(Lsn(5), "BEGIN 501"), &ack)
        .await
        .unwrap();
    let change = consumer.consume(&table_event(6), &ack).await.unwrap();
    let commit = consumer
        .consume(&ReplicationEvent::new(Lsn(7), "COMMIT 501"), &ack)
        .await
        .unwrap();

    assert_eq!(begin.records, 0);
    assert!(!begin.acknowledged);
    assert!(change.acknowledged);
    assert!(!commit.acknowledged);
    assert_eq!(ack.positions(), vec![Lsn(6)]);
    assert_eq!(publisher.sent(), vec!["0,CDC,501,public.users,insert,12".to_string()]);
}

#[tokio::test]
async fn test_filtered_messages_are_not_published_or_acked() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer = wal2json_consumer(
        publisher.clone(),
        OperationFilter::include([ChangeOperation::Delete]),
    );

    let outcome = consumer
        .consume(
            &wal2json_event(10, vec![user_change("insert", 1), user_change("insert", 2)]),
            &ack,
        )
        .await
        .unwrap();

    assert_eq!(outcome.records, 2);
    assert_eq!(outcome.filtered, 2);
    assert!(publisher.sent().is_empty(), "put never called");
    assert!(ack.positions().is_empty(), "no ack without a publish");
}

#[tokio::test]
async fn test_included_messages_published_in_order_with_single_ack() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer = wal2json_consumer(
        publisher.clone(),
        OperationFilter::include([ChangeOperation::Delete]),
    );

    let outcome = consumer
        .consume(
            &wal2json_event(10, vec![user_change("delete", 1), user_change("delete", 2)]),
            &ack,
        )
        .await
        .unwrap();

    assert_eq!(outcome.published, 2);
    assert_eq!(
        publisher.sent(),
        vec![
            "0,CDC,501,public.users,delete,1".to_string(),
            "0,CDC,501,public.users,delete,2".to_string(),
        ]
    );
    assert_eq!(ack.positions(), vec![Lsn(10)]);
}

#[tokio::test]
async fn test_any_accepted_message_acks_whole_event() {
    let publisher = ScriptedPublisher::scripted(&[false, true, false]);
    let ack = RecordingAcknowledger::default();
    let mut consumer = wal2json_consumer(
        publisher.clone(),
        OperationFilter::exclude([ChangeOperation::Truncate]),
    );

    let outcome = consumer
        .consume(
            &wal2json_event(
                42,
                vec![
                    user_change("insert", 1),
                    user_change("update", 2),
                    user_change("delete", 3),
                ],
            ),
            &ack,
        )
        .await
        .unwrap();

    assert_eq!(outcome.published, 1);
    assert_eq!(outcome.rejected, 2);
    assert!(outcome.acknowledged);
    assert_eq!(ack.positions(), vec![Lsn(42)]);
}

#[tokio::test]
async fn test_window_counts_reset_on_new_bucket() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let clock = ManualClock::at(10);
    let mut consumer =
        test_decoding_consumer(publisher, OperationFilter::default(), clock.clone());
    assert_eq!(consumer.window().bucket_start, 10);

    clock.set(11);
    consumer.consume(&table_event(10), &ack).await.unwrap();
    assert_eq!(consumer.window().bucket_start, 10);
    assert_eq!(consumer.window().message_count, 1);
    assert_eq!(consumer.window().byte_size, 100);

    consumer.consume(&table_event(11), &ack).await.unwrap();
    assert_eq!(consumer.window().bucket_start, 10);
    assert_eq!(consumer.window().message_count, 2);
    assert_eq!(consumer.window().byte_size, 200);

    clock.set(20);
    consumer.consume(&table_event(12), &ack).await.unwrap();
    assert_eq!(consumer.window().bucket_start, 20);
    assert_eq!(consumer.window().message_count, 1);
    assert_eq!(consumer.window().byte_size, 100);

    consumer.consume(&table_event(13), &ack).await.unwrap();
    assert_eq!(consumer.window().message_count, 2);
    assert_eq!(consumer.window().byte_size, 200);
}

#[tokio::test]
async fn test_window_counts_events_without_publishing() {
    let publisher = ScriptedPublisher::always(false);
    let ack = RecordingAcknowledger::default();
    let clock = ManualClock::at(30);
    let mut consumer = test_decoding_consumer(publisher, OperationFilter::default(), clock);

    consumer
        .consume(&ReplicationEvent::new(Lsn(1), "BEGIN 9"), &ack)
        .await
        .unwrap();
    consumer.consume(&table_event(2), &ack).await.unwrap();

    assert_eq!(consumer.window().message_count, 2);
    assert!(ack.positions().is_empty());
}

#[tokio::test]
async fn test_parse_error_aborts_cycle() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer =
        test_decoding_consumer(publisher.clone(), OperationFilter::default(), ManualClock::at(0));

    let unknown = consumer
        .consume(
            &ReplicationEvent::new(Lsn(1), "table public.orders: INSERT: id[integer]:1"),
            &ack,
        )
        .await;
    assert!(matches!(unknown, Err(RelayError::MissingTable(_))));

    let garbage = consumer
        .consume(&ReplicationEvent::new(Lsn(2), "SAVEPOINT x"), &ack)
        .await;
    assert!(matches!(garbage, Err(RelayError::UnknownChange(_))));

    assert!(publisher.sent().is_empty());
    assert!(ack.positions().is_empty());
    assert_eq!(consumer.window().message_count, 0);
}

#[tokio::test]
async fn test_ack_never_regresses() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer =
        test_decoding_consumer(publisher, OperationFilter::default(), ManualClock::at(0));

    assert!(consumer.consume(&table_event(50), &ack).await.unwrap().acknowledged);
    assert!(!consumer.consume(&table_event(40), &ack).await.unwrap().acknowledged);
    assert!(consumer.consume(&table_event(60), &ack).await.unwrap().acknowledged);

    assert_eq!(ack.positions(), vec![Lsn(50), Lsn(60)]);
    assert_eq!(consumer.last_acknowledged(), Some(Lsn(60)));
}

#[tokio::test]
async fn test_failed_ack_still_accounts_published_event() {
    let publisher = ScriptedPublisher::always(true);
    let mut consumer =
        test_decoding_consumer(publisher.clone(), OperationFilter::default(), ManualClock::at(0));

    let result = consumer.consume(&table_event(10), &FailingAcknowledger).await;

    assert!(matches!(result, Err(RelayError::Acknowledge(_))));
    assert_eq!(publisher.sent().len(), 1);
    assert_eq!(consumer.window().message_count, 1);
    assert_eq!(consumer.window().byte_size, 100);
    assert_eq!(consumer.last_acknowledged(), None);
}

#[tokio::test]
async fn test_published_compact_messages_decode_to_source_fields() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let mut consumer = wal2json_consumer(publisher.clone(), OperationFilter::default());

    consumer
        .consume(&wal2json_event(1, vec![user_change("UPDATE", 77)]), &ack)
        .await
        .unwrap();

    let sent = publisher.sent();
    let record = decode_compact(&sent[0]).unwrap();
    assert_eq!(record.xid, "501");
    assert_eq!(record.table, "public.users");
    assert_eq!(record.operation, ChangeOperation::Update);
    assert_eq!(record.primary_key, "77");
}

#[tokio::test]
async fn test_full_change_flow_uses_payload_formatter() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let parser =
        RecordParser::for_output_plugin(OutputPlugin::Wal2Json, PrimaryKeyMap::new(), true, None)
            .unwrap();
    let mut consumer = Consumer::with_clock(
        parser,
        Formatter::CsvPayload,
        publisher.clone(),
        OperationFilter::default(),
        Box::new(ManualClock::at(0)),
    );

    let change = json!({
        "kind": "insert", "schema": "public", "table": "orders",
        "columnnames": ["id", "total"], "columntypes": ["integer", "numeric"],
        "columnvalues": [3, 9.5]
    });
    let outcome = consumer
        .consume(&wal2json_event(8, vec![change.clone()]), &ack)
        .await
        .unwrap();

    assert!(outcome.acknowledged);
    let sent = publisher.sent();
    let body: serde_json::Value =
        serde_json::from_str(sent[0].strip_prefix("0,CDC,").unwrap()).unwrap();
    assert_eq!(body, json!({"xid": "501", "change": change}));
}

#[tokio::test]
async fn test_full_change_with_compact_formatter_is_fatal() {
    let publisher = ScriptedPublisher::always(true);
    let ack = RecordingAcknowledger::default();
    let parser =
        RecordParser::for_output_plugin(OutputPlugin::Wal2Json, PrimaryKeyMap::new(), true, None)
            .unwrap();
    let mut consumer = Consumer::new(
        parser,
        Formatter::Csv,
        publisher.clone(),
        OperationFilter::default(),
    );

    let result = consumer
        .consume(&wal2json_event(8, vec![user_change("insert", 1)]), &ack)
        .await;

    assert!(matches!(result, Err(RelayError::UnsupportedChange { .. })));
    assert!(publisher.sent().is_empty());
}
