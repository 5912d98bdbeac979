use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::{
    ConversionError, Envelope, Processor, ProcessorBuilder, ProcessorHook, PublishHeaders,
    SourceMessage,
    message::ConversionFailurePolicy,
    processor::ListenerError,
    source::{self, Disposition, Feed, Ledger, Settled},
    transport::{self, RawPayload, Sender, Transport, layers::JsonLayer},
};

const SUBSCRIPTION: &str = "projects/census/subscriptions/eq-receipts";
const ROUTING_KEY: &str = "event.response.receipt";
const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct Receipt {
    tx_id: String,
    questionnaire_id: Option<String>,
}

impl SourceMessage for Receipt {
    fn transaction_id(&self) -> &str {
        &self.tx_id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct ResponseReceived {
    tx_id: String,
    questionnaire_id: String,
}

fn unmarshal(payload: &[u8]) -> Result<Receipt, tower::BoxError> {
    Ok(serde_json::from_slice(payload)?)
}

fn convert(receipt: &Receipt) -> Result<ResponseReceived, ConversionError<ResponseReceived>> {
    match receipt.tx_id.as_str() {
        "unconvertible" => return Err(ConversionError::new("no mapping for receipt")),
        "panicking" => panic!("converter bug"),
        _ => {}
    }
    match &receipt.questionnaire_id {
        Some(questionnaire_id) => Ok(ResponseReceived {
            tx_id: receipt.tx_id.clone(),
            questionnaire_id: questionnaire_id.clone(),
        }),
        None => Err(ConversionError::partial(
            ResponseReceived {
                tx_id: receipt.tx_id.clone(),
                questionnaire_id: String::new(),
            },
            "missing questionnaire_id",
        )),
    }
}

fn receipt(tx_id: &str, questionnaire_id: Option<&str>) -> Vec<u8> {
    serde_json::to_vec(&json!({ "tx_id": tx_id, "questionnaire_id": questionnaire_id })).unwrap()
}

fn new_sink() -> transport::InMemory<PublishHeaders, RawPayload> {
    transport::InMemory::default()
}

fn body(envelope: &Envelope<PublishHeaders, RawPayload>) -> String {
    String::from_utf8(envelope.message.clone().into_inner()).unwrap()
}

async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out waiting for the processor")
}

#[derive(Clone, Default)]
struct RecordingHook {
    events: Arc<std::sync::Mutex<Vec<String>>>,
}

impl RecordingHook {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

impl ProcessorHook for RecordingHook {
    fn on_listener_start(&self, subscription: &str) {
        self.record(format!("listener_start:{subscription}"));
    }

    fn on_listener_stop(&self, subscription: &str) {
        self.record(format!("listener_stop:{subscription}"));
    }

    fn on_listener_error(&self, subscription: &str, _error: &dyn std::error::Error) {
        self.record(format!("listener_error:{subscription}"));
    }

    fn on_delivery_received(&self, _payload: &[u8]) {
        self.record("received".to_owned());
    }

    fn on_unmarshal_error(&self, payload: &[u8], _error: &dyn std::error::Error) {
        self.record(format!(
            "unmarshal_error:{}",
            String::from_utf8_lossy(payload)
        ));
    }

    fn on_transaction(&self, transaction_id: &str) {
        self.record(format!("transaction:{transaction_id}"));
    }

    fn on_conversion_error(&self, transaction_id: &str, _error: &dyn std::error::Error) {
        self.record(format!("conversion_error:{transaction_id}"));
    }

    fn on_publish_error(&self, transaction_id: &str, _error: &dyn std::error::Error) {
        self.record(format!("publish_error:{transaction_id}"));
    }

    fn on_published(&self, transaction_id: &str, routing_key: &str) {
        self.record(format!("published:{transaction_id}:{routing_key}"));
    }

    fn on_settle_error(&self, disposition: Disposition, _error: &dyn std::error::Error) {
        self.record(format!("settle_error:{disposition}"));
    }

    fn on_pipeline_stop(&self, _subscription: &str, rejected_on_drain: usize) {
        self.record(format!("pipeline_stop:{rejected_on_drain}"));
    }

    fn on_close_error(&self, resource: &str, _error: &dyn std::error::Error) {
        self.record(format!("close_error:{resource}"));
    }
}

/// Fails the first `failures` publishes, then records like `InMemory`.
#[derive(Clone)]
struct FlakySender {
    failures: Arc<AtomicUsize>,
    sent: transport::InMemory<PublishHeaders, RawPayload>,
}

impl FlakySender {
    fn new(failures: usize, sent: transport::InMemory<PublishHeaders, RawPayload>) -> Self {
        Self {
            failures: Arc::new(AtomicUsize::new(failures)),
            sent,
        }
    }
}

#[async_trait]
impl Sender<PublishHeaders, RawPayload> for FlakySender {
    type Error = tower::BoxError;

    async fn send(
        &mut self,
        envelope: Envelope<PublishHeaders, RawPayload>,
    ) -> Result<(), Self::Error> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err("channel closed by broker".into());
        }
        self.sent.send(envelope).await?;
        Ok(())
    }
}

/// Blocks every publish until the test adds a permit to `gate`.
#[derive(Clone)]
struct GatedSender {
    entered: Arc<Notify>,
    gate: Arc<Semaphore>,
    sent: transport::InMemory<PublishHeaders, RawPayload>,
}

#[async_trait]
impl Sender<PublishHeaders, RawPayload> for GatedSender {
    type Error = tower::BoxError;

    async fn send(
        &mut self,
        envelope: Envelope<PublishHeaders, RawPayload>,
    ) -> Result<(), Self::Error> {
        self.entered.notify_one();
        self.gate.acquire().await?.forget();
        self.sent.send(envelope).await?;
        Ok(())
    }
}

struct Harness {
    processor: Processor,
    feed: Feed,
    ledger: Ledger,
    failures: mpsc::Receiver<ListenerError>,
    cancel: CancellationToken,
    hook: RecordingHook,
}

fn start<Snd>(sender: Snd, policy: ConversionFailurePolicy) -> Harness
where
    Snd: Sender<PublishHeaders, RawPayload> + Clone + Send + 'static,
{
    let (subscription, feed) = source::InMemory::new(SUBSCRIPTION);
    let ledger = subscription.ledger();
    let (errors, failures) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let hook = RecordingHook::default();

    let processor = ProcessorBuilder::new(
        subscription,
        Transport::new(sender).layer(JsonLayer),
        ROUTING_KEY,
    )
    .with_hook(hook.clone())
    .on_conversion_failure(policy)
    .start(unmarshal, convert, errors, &cancel);

    Harness {
        processor,
        feed,
        ledger,
        failures,
        cancel,
        hook,
    }
}

fn settled(id: u64, disposition: Disposition) -> Settled {
    Settled { id, disposition }
}

#[tokio::test]
async fn successful_delivery_is_published_once_and_acked() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::default());

    harness.feed.publish(receipt("abc-1", Some("q-1")));

    let settlements = within(harness.ledger.wait_settled(1)).await;
    assert_eq!(settlements, vec![settled(1, Disposition::Ack)]);

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers.routing_key(), ROUTING_KEY);
    assert_eq!(sent[0].headers.transaction_id(), "abc-1");

    let expected = serde_json::to_vec(&ResponseReceived {
        tx_id: "abc-1".to_owned(),
        questionnaire_id: "q-1".to_owned(),
    })
    .unwrap();
    assert_eq!(sent[0].message.clone().into_inner(), expected);
    assert!(body(&sent[0]).contains(r#""tx_id":"abc-1""#));

    harness.processor.shutdown().await;
    assert_eq!(harness.ledger.settled().len(), 1);
    assert_eq!(
        harness.hook.count(&format!("published:abc-1:{ROUTING_KEY}")),
        1
    );
}

#[tokio::test]
async fn undecodable_delivery_is_acked_and_next_delivery_still_processed() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::default());

    harness.feed.publish(b"not json".to_vec());
    harness.feed.publish(receipt("abc-2", Some("q-2")));

    let settlements = within(harness.ledger.wait_settled(2)).await;
    assert_eq!(
        settlements,
        vec![settled(1, Disposition::Ack), settled(2, Disposition::Ack)]
    );

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers.transaction_id(), "abc-2");
    assert_eq!(harness.hook.count("unmarshal_error:not json"), 1);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn publish_failure_rejects_and_loop_continues() {
    let sink = new_sink();
    let harness = start(
        FlakySender::new(1, sink.clone()),
        ConversionFailurePolicy::default(),
    );

    harness.feed.publish(receipt("abc-3", Some("q-3")));
    harness.feed.publish(receipt("abc-4", Some("q-4")));

    let settlements = within(harness.ledger.wait_settled(2)).await;
    assert_eq!(
        settlements,
        vec![settled(1, Disposition::Nack), settled(2, Disposition::Ack)]
    );

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers.transaction_id(), "abc-4");
    assert_eq!(harness.hook.count("publish_error:abc-3"), 1);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn cancellation_with_empty_queue_stops_both_loops() {
    let sink = new_sink();
    let mut harness = start(sink.clone(), ConversionFailurePolicy::default());

    harness.cancel.cancel();
    within(async {
        while !harness.processor.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    harness.feed.publish(receipt("late", Some("q-late")));
    tokio::task::yield_now().await;

    assert_eq!(harness.ledger.pulled(), 0);
    assert!(harness.failures.try_recv().is_err());

    within(harness.processor.shutdown()).await;
    assert!(sink.is_empty().await);
    assert_eq!(harness.hook.count(&format!("listener_stop:{SUBSCRIPTION}")), 1);
    assert_eq!(harness.hook.count("pipeline_stop:0"), 1);
}

#[tokio::test]
async fn conversion_failure_publishes_partial_message_by_default() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::PublishPartial);

    harness.feed.publish(receipt("abc-5", None));

    let settlements = within(harness.ledger.wait_settled(1)).await;
    assert_eq!(settlements, vec![settled(1, Disposition::Ack)]);

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(body(&sent[0]), r#"{"tx_id":"abc-5","questionnaire_id":""}"#);
    assert_eq!(harness.hook.count("conversion_error:abc-5"), 1);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn conversion_failure_rejects_under_reject_policy() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::Reject);

    harness.feed.publish(receipt("abc-6", None));
    harness.feed.publish(receipt("abc-7", Some("q-7")));

    let settlements = within(harness.ledger.wait_settled(2)).await;
    assert_eq!(
        settlements,
        vec![settled(1, Disposition::Nack), settled(2, Disposition::Ack)]
    );

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers.transaction_id(), "abc-7");

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn conversion_failure_without_partial_message_is_rejected() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::PublishPartial);

    harness.feed.publish(receipt("unconvertible", Some("q-8")));

    let settlements = within(harness.ledger.wait_settled(1)).await;
    assert_eq!(settlements, vec![settled(1, Disposition::Nack)]);
    assert!(sink.is_empty().await);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn listener_error_is_forwarded_once() {
    let sink = new_sink();
    let mut harness = start(sink, ConversionFailurePolicy::default());

    harness.feed.fail("stream reset by peer");

    let err = within(harness.failures.recv())
        .await
        .expect("listener error");
    assert_eq!(err.subscription(), SUBSCRIPTION);
    assert!(err.to_string().contains("stream reset by peer"));

    harness.processor.shutdown().await;
    assert!(harness.failures.recv().await.is_none());
    assert_eq!(harness.hook.count("listener_error:"), 1);
    assert_eq!(harness.hook.count("pipeline_stop:0"), 1);
}

#[tokio::test]
async fn queued_deliveries_are_rejected_on_shutdown() {
    let sink = new_sink();
    let entered = Arc::new(Notify::new());
    let gate = Arc::new(Semaphore::new(0));
    let harness = start(
        GatedSender {
            entered: Arc::clone(&entered),
            gate: Arc::clone(&gate),
            sent: sink.clone(),
        },
        ConversionFailurePolicy::default(),
    );

    for n in 1..=3 {
        harness
            .feed
            .publish(receipt(&format!("abc-q{n}"), Some("q")));
    }

    // First delivery is held in publish, second fills the queue slot, third
    // waits in the listener for room.
    within(entered.notified()).await;
    within(harness.ledger.wait_pulled(3)).await;

    harness.cancel.cancel();
    gate.add_permits(1);
    within(harness.processor.shutdown()).await;

    let mut settlements = harness.ledger.settled();
    settlements.sort_by_key(|s| s.id);
    assert_eq!(
        settlements,
        vec![
            settled(1, Disposition::Ack),
            settled(2, Disposition::Nack),
            settled(3, Disposition::Nack),
        ]
    );
    assert_eq!(sink.len().await, 1);
    assert_eq!(harness.hook.count("pipeline_stop:1"), 1);
}

#[tokio::test]
async fn deliveries_are_published_in_handoff_order() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::default());

    for tx_id in ["t-1", "t-2", "t-3"] {
        harness.feed.publish(receipt(tx_id, Some("q")));
    }
    within(harness.ledger.wait_settled(3)).await;

    let order: Vec<_> = sink
        .sent_messages()
        .await
        .iter()
        .map(|e| e.headers.transaction_id().to_owned())
        .collect();
    assert_eq!(order, ["t-1", "t-2", "t-3"]);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn identical_deliveries_are_published_independently() {
    let sink = new_sink();
    let harness = start(sink.clone(), ConversionFailurePolicy::default());

    let payload = receipt("dup-1", Some("q-dup"));
    harness.feed.publish(payload.clone());
    harness.feed.publish(payload);

    let settlements = within(harness.ledger.wait_settled(2)).await;
    assert_eq!(
        settlements,
        vec![settled(1, Disposition::Ack), settled(2, Disposition::Ack)]
    );

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], sent[1]);

    harness.processor.shutdown().await;
}

#[tokio::test]
async fn close_errors_do_not_stop_remaining_closes() {
    struct Failing(&'static str);
    struct Closing(Arc<AtomicUsize>);

    #[async_trait]
    impl crate::processor::Resource for Failing {
        fn describe(&self) -> &str {
            self.0
        }

        async fn close(&self) -> Result<(), tower::BoxError> {
            Err("already closed".into())
        }
    }

    #[async_trait]
    impl crate::processor::Resource for Closing {
        fn describe(&self) -> &str {
            "connection"
        }

        async fn close(&self) -> Result<(), tower::BoxError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let (subscription, _feed) = source::InMemory::new(SUBSCRIPTION);
    let sink = new_sink();
    let (errors, _failures) = mpsc::channel(1);
    let hook = RecordingHook::default();
    let closed = Arc::new(AtomicUsize::new(0));

    let transport = Transport::new(sink).layer(JsonLayer);
    let processor = ProcessorBuilder::new(subscription, transport, ROUTING_KEY)
        .with_hook(hook.clone())
        .with_resource(Failing("channel"))
        .with_resource(Closing(Arc::clone(&closed)))
        .start(unmarshal, convert, errors, &CancellationToken::new());

    within(processor.shutdown()).await;

    assert_eq!(hook.count("close_error:channel"), 1);
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_converter_rejects_delivery_and_loop_continues() {
    let sink = new_sink();
    let mut harness = start(sink.clone(), ConversionFailurePolicy::default());

    harness.feed.publish(receipt("panicking", Some("q-p")));
    harness.feed.publish(receipt("abc-9", Some("q-9")));

    let settlements = within(harness.ledger.wait_settled(2)).await;
    assert_eq!(
        settlements,
        vec![settled(1, Disposition::Nack), settled(2, Disposition::Ack)]
    );

    let sent = sink.sent_messages().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].headers.transaction_id(), "abc-9");
    assert_eq!(harness.hook.count("conversion_error:panicking"), 1);
    assert!(harness.failures.try_recv().is_err());

    harness.processor.shutdown().await;
}

/// Panics on every publish, taking the pipeline task down with it.
#[derive(Clone)]
struct PanickingSender;

#[async_trait]
impl Sender<PublishHeaders, RawPayload> for PanickingSender {
    type Error = tower::BoxError;

    async fn send(
        &mut self,
        _envelope: Envelope<PublishHeaders, RawPayload>,
    ) -> Result<(), Self::Error> {
        panic!("sender bug")
    }
}

#[tokio::test]
async fn pipeline_failure_stops_listener_and_is_reported() {
    let mut harness = start(PanickingSender, ConversionFailurePolicy::default());

    harness.feed.publish(receipt("abc-10", Some("q-10")));

    let err = within(harness.failures.recv())
        .await
        .expect("listener error");
    assert_eq!(err.subscription(), SUBSCRIPTION);
    assert!(err.to_string().contains("pipeline stopped"));

    within(async {
        while !harness.processor.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    // Nothing pulls once the listener has stopped.
    harness.feed.publish(receipt("abc-11", Some("q-11")));
    tokio::task::yield_now().await;
    assert_eq!(harness.ledger.pulled(), 1);

    within(harness.processor.shutdown()).await;
    assert_eq!(harness.hook.count("listener_error:"), 1);
    assert_eq!(harness.hook.count("close_error:pipeline task"), 1);
}

/// Delivery whose broker refuses every ack and nack.
struct Unsettleable {
    payload: Vec<u8>,
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl crate::source::Delivery for Unsettleable {
    type Error = std::io::Error;

    fn payload(&self) -> &[u8] {
        &self.payload
    }

    async fn ack(self) -> Result<(), Self::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::other("ack deadline expired"))
    }

    async fn nack(self) -> Result<(), Self::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(std::io::Error::other("ack deadline expired"))
    }
}

#[tokio::test]
async fn settle_failure_is_reported_and_not_retried() {
    let sink = new_sink();
    let hook = RecordingHook::default();
    let attempts = Arc::new(AtomicUsize::new(0));
    let pipeline = super::pipeline::Pipeline::<Receipt, ResponseReceived, _> {
        subscription: SUBSCRIPTION.to_owned(),
        routing_key: ROUTING_KEY.to_owned(),
        unmarshal: Arc::new(unmarshal),
        convert: Arc::new(convert),
        policy: ConversionFailurePolicy::default(),
        transport: Transport::new(sink.clone()).layer(JsonLayer),
        hook: Arc::new(hook.clone()),
    };
    let (handoff, queue) = mpsc::channel(1);
    let task = tokio::spawn(pipeline.run(queue, CancellationToken::new()));

    for tx_id in ["abc-12", "abc-13"] {
        handoff
            .send(Unsettleable {
                payload: receipt(tx_id, Some("q")),
                attempts: Arc::clone(&attempts),
            })
            .await
            .unwrap();
    }
    drop(handoff);
    within(task).await.unwrap();

    assert_eq!(sink.len().await, 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(hook.count("settle_error:ack"), 2);
    assert_eq!(hook.count("pipeline_stop:0"), 1);
}

#[cfg(all(feature = "pubsub", feature = "rabbitmq"))]
#[tokio::test]
async fn unusable_broker_uri_fails_connect_before_anything_starts() {
    use crate::{
        ProcessorErrorKind,
        config::{Pairing, Settings},
    };

    let settings = Settings {
        rabbit_connection_string: "not an amqp uri".to_owned(),
        events_exchange: "events".to_owned(),
        log_level: "INFO".to_owned(),
        publisher_confirms: true,
        conversion_failure: ConversionFailurePolicy::default(),
    };
    let pairing = Pairing::new("census", "eq-receipts", ROUTING_KEY);
    let (errors, _failures) = mpsc::channel(1);

    let result = within(Processor::connect(
        &settings,
        &pairing,
        unmarshal,
        convert,
        errors,
        &CancellationToken::new(),
    ))
    .await;

    match result {
        Ok(_) => panic!("connect should fail on an unparsable URI"),
        Err(err) => assert!(matches!(err.kind(), ProcessorErrorKind::Destination(_))),
    }
}
