//! End-to-end pipeline tests against the in-memory broker and dedup store.
//!
//! Everything runs on a paused tokio clock, so backoff delays are exact and the
//! suite finishes instantly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use courier_broker::{
    Broker, BrokerError, BrokerEvent, Delivery, MemoryBroker, PublishOptions, Topology,
};
use courier_common::types::{DeliveryRequest, OutboundEmail};
use courier_notifier::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use courier_notifier::dedup::MemoryDedupStore;
use courier_notifier::pipeline::{DeliveryPipeline, Outcome, PipelineConfig};
use courier_notifier::provider::ProviderChain;
use courier_notifier::retry::RetryPolicy;
use courier_notifier::transport::{Transport, TransportError};

const EXCHANGE: &str = "notifications.direct";
const QUEUE: &str = "email.queue";
const DLQ: &str = "failed.queue";

/// Transport that replays a script of results (then repeats `fallback`) and records
/// when each call happened.
struct FakeTransport {
    name: &'static str,
    script: Mutex<VecDeque<bool>>,
    fallback: bool,
    latency: Duration,
    calls: Mutex<Vec<(Instant, OutboundEmail)>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeTransport {
    fn succeeding(name: &'static str) -> Arc<Self> {
        Self::build(name, &[], true, Duration::ZERO)
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Self::build(name, &[], false, Duration::ZERO)
    }

    fn scripted(name: &'static str, script: &[bool]) -> Arc<Self> {
        Self::build(name, script, true, Duration::ZERO)
    }

    fn slow(name: &'static str, latency: Duration) -> Arc<Self> {
        Self::build(name, &[], true, latency)
    }

    fn build(name: &'static str, script: &[bool], fallback: bool, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            name,
            script: Mutex::new(script.iter().copied().collect()),
            fallback,
            latency,
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn name(&self) -> &str {
        self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        self.calls.lock().push((Instant::now(), email.clone()));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let ok = self.script.lock().pop_front().unwrap_or(self.fallback);
        if ok {
            Ok(())
        } else {
            Err(TransportError::Rejected {
                status: 503,
                body: format!("{} unavailable", self.name),
            })
        }
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    dedup: Arc<MemoryDedupStore>,
    pipeline: Arc<DeliveryPipeline>,
}

impl Harness {
    async fn new(chain: ProviderChain, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        Self::with_topology(
            Topology::direct(EXCHANGE).bind_queue(QUEUE).bind_queue(DLQ),
            chain,
            tweak,
        )
        .await
    }

    async fn with_topology(
        topology: Topology,
        chain: ProviderChain,
        tweak: impl FnOnce(&mut PipelineConfig),
    ) -> Self {
        let broker = Arc::new(MemoryBroker::new());
        broker.declare(&topology).await.unwrap();
        let dedup = Arc::new(MemoryDedupStore::default());

        let mut config = PipelineConfig::new(EXCHANGE, QUEUE, DLQ, "noreply@example.com");
        config.retry = RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(2_000),
        };
        tweak(&mut config);

        let pipeline = Arc::new(DeliveryPipeline::new(
            broker.clone(),
            dedup.clone(),
            Arc::new(chain),
            config,
        ));
        Self {
            broker,
            dedup,
            pipeline,
        }
    }

    /// Receive and handle exactly one message.
    async fn handle_next(&self) -> Outcome {
        let delivery = self
            .broker
            .receive(QUEUE, Duration::from_millis(10))
            .await
            .unwrap()
            .expect("a message on the live queue");
        self.pipeline
            .handle(delivery, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Run the consumer loop until `done` holds, then shut it down.
    async fn run_until(&self, done: impl Fn(&Self) -> bool) {
        let shutdown = CancellationToken::new();
        let consumer = tokio::spawn(self.pipeline.clone().run(shutdown.clone()));

        let deadline = Instant::now() + Duration::from_secs(600);
        while !done(self) {
            assert!(Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        shutdown.cancel();
        consumer.await.unwrap().unwrap();
    }

    fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.broker.messages(DLQ)
    }

    fn breaker_state(&self, provider: &str) -> CircuitState {
        self.pipeline
            .chain()
            .breaker(provider)
            .map(|b| b.state())
            .expect("provider registered")
    }

    fn acked(&self) -> usize {
        self.broker
            .events()
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Acked { .. }))
            .count()
    }

    fn requeued(&self) -> usize {
        self.broker
            .events()
            .iter()
            .filter(|e| matches!(e, BrokerEvent::Requeued { .. }))
            .count()
    }
}

/// Broker whose `receive` always fails; everything else goes to a [`MemoryBroker`].
#[derive(Default)]
struct UnreachableBroker {
    inner: MemoryBroker,
    receives: AtomicUsize,
}

#[async_trait]
impl Broker for UnreachableBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.inner.declare(topology).await
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        self.inner.recover(queue).await
    }

    async fn receive(&self, _queue: &str, _wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        Err(BrokerError::UnknownExchange("connection lost".to_string()))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.inner.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.inner.nack(delivery, requeue).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        self.inner.publish(exchange, routing_key, payload, options).await
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        self.inner.ping().await
    }
}

fn payload(value: Value) -> Vec<u8> {
    serde_json::to_vec(&value).unwrap()
}

fn request(request_id: &str) -> Vec<u8> {
    payload(json!({
        "request_id": request_id,
        "to_email": "user@example.com",
        "subject": "Pizza",
        "text_body": "ready"
    }))
}

fn chain(transports: &[Arc<FakeTransport>], failure_threshold: u32) -> ProviderChain {
    transports.iter().fold(ProviderChain::new(), |chain, t| {
        chain.with_provider(
            t.clone(),
            CircuitBreakerConfig {
                failure_threshold,
                recovery_time: Duration::from_millis(10_000),
            },
        )
    })
}

#[tokio::test(start_paused = true)]
async fn test_delivered_message_is_acked() {
    let primary = FakeTransport::succeeding("resend");
    let harness = Harness::new(chain(&[primary.clone()], 5), |_| {}).await;
    harness.broker.enqueue(QUEUE, request("r1"));

    assert_eq!(
        harness.handle_next().await,
        Outcome::Delivered {
            provider: "resend".to_string()
        }
    );

    let (_, email) = primary.calls.lock()[0].clone();
    assert_eq!(email.from, "noreply@example.com");
    assert_eq!(email.to, "user@example.com");
    assert_eq!(email.text.as_deref(), Some("ready"));
    assert_eq!(harness.broker.unacked_count(), 0);
    assert_eq!(harness.acked(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_are_dead_lettered_verbatim() {
    let a = FakeTransport::failing("resend");
    let b = FakeTransport::failing("smtp");
    let harness = Harness::new(chain(&[a.clone(), b.clone()], 5), |_| {}).await;
    let original = request("test0004");
    harness.broker.enqueue(QUEUE, original.clone());

    harness.run_until(|h| !h.dead_letters().is_empty()).await;

    // Initial attempt plus three retries, each through both providers
    let times = a.call_times();
    assert_eq!(times.len(), 4);
    assert_eq!(b.call_count(), 4);
    let gaps: Vec<_> = times.windows(2).map(|w| w[1] - w[0]).collect();
    for (gap, expected) in gaps.iter().zip([2_000, 4_000, 8_000]) {
        let expected = Duration::from_millis(expected);
        assert!(
            *gap >= expected && *gap < expected + Duration::from_millis(50),
            "gap {gap:?}, expected {expected:?}"
        );
    }

    // The dead-lettered copy is byte-identical to the last attempt consumed
    let republished: Vec<Vec<u8>> = harness
        .broker
        .events()
        .into_iter()
        .filter_map(|e| match e {
            BrokerEvent::Published {
                routing_key,
                payload,
                persistent,
                ..
            } if routing_key == QUEUE => {
                assert!(persistent);
                Some(payload)
            }
            _ => None,
        })
        .collect();
    assert_eq!(republished.len(), 3);

    let dead = harness.dead_letters();
    assert_eq!(dead, vec![republished[2].clone()]);
    let dead_request = DeliveryRequest::decode(&dead[0]).unwrap();
    assert_eq!(dead_request.retry_count, 3);
    assert_eq!(dead_request.request_id, "test0004");

    assert!(harness.broker.messages(QUEUE).is_empty());
    assert_eq!(harness.broker.unacked_count(), 0);
    assert_eq!(harness.acked(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_final_attempt_dead_letters_original_bytes() {
    let harness = Harness::new(chain(&[FakeTransport::failing("resend")], 5), |_| {}).await;
    // Unusual formatting must survive untouched
    let original = br#"{ "request_id":"r9", "retry_count":3, "to_email":"u@example.com", "subject":"s", "html_body":"<p/>" }"#.to_vec();
    harness.broker.enqueue(QUEUE, original.clone());

    assert_eq!(harness.handle_next().await, Outcome::DeadLettered);
    assert_eq!(harness.dead_letters(), vec![original]);
    assert!(harness.broker.messages(QUEUE).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_retry_preserves_unknown_fields() {
    let harness = Harness::new(chain(&[FakeTransport::failing("resend")], 5), |_| {}).await;
    harness.broker.enqueue(
        QUEUE,
        payload(json!({
            "request_id": "r1",
            "retry_count": 1,
            "to_email": "user@example.com",
            "subject": "Pizza",
            "text_body": "ready",
            "campaign": {"id": 42, "tags": ["a", "b"]},
            "locale": "fr"
        })),
    );

    assert_eq!(
        harness.handle_next().await,
        Outcome::Retried {
            next_retry: 2,
            delay: Duration::from_millis(4_000)
        }
    );

    let republished: Value = serde_json::from_slice(&harness.broker.messages(QUEUE)[0]).unwrap();
    assert_eq!(
        republished,
        json!({
            "request_id": "r1",
            "retry_count": 2,
            "to_email": "user@example.com",
            "subject": "Pizza",
            "text_body": "ready",
            "campaign": {"id": 42, "tags": ["a", "b"]},
            "locale": "fr"
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_retry_acks_only_after_republish() {
    let harness = Harness::new(chain(&[FakeTransport::failing("resend")], 5), |_| {}).await;
    harness.broker.enqueue(QUEUE, request("r1"));

    let delivery = harness
        .broker
        .receive(QUEUE, Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    let pipeline = harness.pipeline.clone();
    let attempt =
        tokio::spawn(async move { pipeline.handle(delivery, &CancellationToken::new()).await });

    // Mid-backoff: still held, nothing published yet
    tokio::time::sleep(Duration::from_millis(1_999)).await;
    assert_eq!(harness.broker.unacked_count(), 1);
    assert!(harness.broker.messages(QUEUE).is_empty());

    let outcome = attempt.await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Retried { next_retry: 1, .. }));
    assert_eq!(harness.broker.unacked_count(), 0);
    assert_eq!(harness.broker.messages(QUEUE).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_primary_while_fallback_delivers() {
    let a = FakeTransport::failing("resend");
    let b = FakeTransport::succeeding("smtp");
    let harness = Harness::new(chain(&[a.clone(), b.clone()], 2), |_| {}).await;

    for i in 0..5 {
        harness.broker.enqueue(QUEUE, request(&format!("r{i}")));
        assert_eq!(
            harness.handle_next().await,
            Outcome::Delivered {
                provider: "smtp".to_string()
            }
        );
    }

    // Two failures open the circuit; the remaining three never reach provider A
    assert_eq!(a.call_count(), 2);
    assert_eq!(b.call_count(), 5);
    assert_eq!(harness.breaker_state("resend"), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_message_is_rejected_without_retry() {
    let transport = FakeTransport::succeeding("resend");
    let harness = Harness::new(chain(&[transport.clone()], 5), |_| {}).await;

    for raw in [
        b"not json at all".to_vec(),
        b"[1, 2, 3]".to_vec(),
        payload(json!({"to_email": "u@example.com", "subject": "s", "text_body": "t"})),
        payload(json!({"request_id": "r1", "to_email": "u@example.com", "subject": "s"})),
    ] {
        harness.broker.enqueue(QUEUE, raw);
        assert_eq!(harness.handle_next().await, Outcome::Rejected);
    }

    assert_eq!(transport.call_count(), 0);
    assert!(harness.dead_letters().is_empty());
    assert!(harness.broker.messages(QUEUE).is_empty());
    assert!(
        harness
            .broker
            .events()
            .iter()
            .all(|e| matches!(e, BrokerEvent::Rejected { .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicates_deliver_once() {
    let transport = FakeTransport::slow("resend", Duration::from_millis(100));
    let harness = Harness::new(chain(&[transport.clone()], 5), |c| c.concurrency = 4).await;
    harness.broker.enqueue(QUEUE, request("test0004"));
    harness.broker.enqueue(QUEUE, request("test0004"));

    harness.run_until(|h| h.acked() == 2).await;

    assert_eq!(transport.call_count(), 1);
    assert!(harness.dedup.is_marked("idempotency:test0004:0"));
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_attempt_is_duplicate() {
    let transport = FakeTransport::succeeding("resend");
    let harness = Harness::new(chain(&[transport.clone()], 5), |_| {}).await;

    harness.broker.enqueue(QUEUE, request("r1"));
    harness.handle_next().await;
    harness.broker.enqueue(QUEUE, request("r1"));

    assert_eq!(harness.handle_next().await, Outcome::Duplicate);
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_outage_fails_open_by_default() {
    let transport = FakeTransport::succeeding("resend");
    let harness = Harness::new(chain(&[transport.clone()], 5), |_| {}).await;
    harness.dedup.set_unavailable(true);
    harness.broker.enqueue(QUEUE, request("r1"));

    assert!(matches!(
        harness.handle_next().await,
        Outcome::Delivered { .. }
    ));
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dedup_outage_fail_closed_requeues() {
    let transport = FakeTransport::succeeding("resend");
    let harness = Harness::new(chain(&[transport.clone()], 5), |c| {
        c.dedup_fail_open = false
    })
    .await;
    harness.dedup.set_unavailable(true);
    let raw = request("r1");
    harness.broker.enqueue(QUEUE, raw.clone());

    let delivery = harness
        .broker
        .receive(QUEUE, Duration::from_millis(10))
        .await
        .unwrap()
        .unwrap();
    let pipeline = harness.pipeline.clone();
    let attempt =
        tokio::spawn(async move { pipeline.handle(delivery, &CancellationToken::new()).await });

    // Held for the requeue delay before going back
    tokio::time::sleep(Duration::from_millis(4_999)).await;
    assert_eq!(harness.broker.unacked_count(), 1);
    assert!(harness.broker.messages(QUEUE).is_empty());

    assert_eq!(attempt.await.unwrap().unwrap(), Outcome::Requeued);
    assert_eq!(transport.call_count(), 0);
    assert_eq!(harness.broker.messages(QUEUE), vec![raw]);

    // Store back: the requeued message goes through normally
    harness.dedup.set_unavailable(false);
    assert!(matches!(
        harness.handle_next().await,
        Outcome::Delivered { .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_backoff_leaves_message_recoverable() {
    let transport = FakeTransport::scripted("resend", &[false]);
    let harness = Harness::new(chain(&[transport.clone()], 5), |_| {}).await;
    harness.broker.enqueue(QUEUE, request("r1"));

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(harness.pipeline.clone().run(shutdown.clone()));
    while transport.call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The attempt is now sleeping on its 2s backoff
    shutdown.cancel();
    consumer.await.unwrap().unwrap();

    assert_eq!(harness.broker.unacked_count(), 1);
    assert!(harness.broker.messages(QUEUE).is_empty());
    assert!(!harness.dedup.is_marked("idempotency:r1:0"));

    // Next start recovers it and the same attempt runs again
    harness.run_until(|h| h.acked() == 1).await;
    assert_eq!(transport.call_count(), 2);
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_cap_bounds_unacked_messages() {
    let transport = FakeTransport::slow("resend", Duration::from_millis(500));
    let harness = Harness::new(chain(&[transport.clone()], 5), |c| c.concurrency = 3).await;
    for i in 0..10 {
        harness.broker.enqueue(QUEUE, request(&format!("r{i}")));
    }

    let peak_unacked = Arc::new(AtomicUsize::new(0));
    let watcher = {
        let broker = harness.broker.clone();
        let peak = peak_unacked.clone();
        tokio::spawn(async move {
            loop {
                peak.fetch_max(broker.unacked_count(), Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    harness.run_until(|h| h.acked() == 10).await;
    watcher.abort();

    assert_eq!(transport.call_count(), 10);
    assert_eq!(transport.peak_in_flight.load(Ordering::SeqCst), 3);
    assert!(peak_unacked.load(Ordering::SeqCst) <= 3);
}

#[tokio::test(start_paused = true)]
async fn test_unroutable_dead_letter_requeues_original() {
    // Dead-letter queue deliberately not bound
    let harness = Harness::with_topology(
        Topology::direct(EXCHANGE).bind_queue(QUEUE),
        chain(&[FakeTransport::failing("resend")], 5),
        |c| c.retry.max_retries = 1,
    )
    .await;
    let raw = request("r1");
    harness.broker.enqueue(QUEUE, raw.clone());

    assert_eq!(harness.handle_next().await, Outcome::Requeued);
    assert_eq!(harness.broker.messages(QUEUE), vec![raw]);
    // Released, so the requeued attempt is not mistaken for a duplicate
    assert!(!harness.dedup.is_marked("idempotency:r1:0"));
}

#[tokio::test(start_paused = true)]
async fn test_requeue_after_failed_publish_is_paced() {
    let transport = FakeTransport::failing("resend");
    let harness = Harness::with_topology(
        Topology::direct(EXCHANGE).bind_queue(QUEUE),
        chain(&[transport.clone()], 100),
        |c| {
            c.retry.max_retries = 1;
            c.concurrency = 1;
            c.requeue_delay = Duration::from_secs(1);
        },
    )
    .await;
    harness.broker.enqueue(QUEUE, request("r1"));

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(harness.pipeline.clone().run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(10_500)).await;
    shutdown.cancel();
    consumer.await.unwrap().unwrap();

    // One pass per requeue delay, not a busy loop
    let times = transport.call_times();
    assert!((10..=12).contains(&times.len()), "{} passes", times.len());
    for gap in times.windows(2).map(|w| w[1] - w[0]) {
        assert!(gap >= Duration::from_secs(1), "gap {gap:?}");
    }
    assert_eq!(harness.requeued(), times.len());
    assert_eq!(harness.broker.messages(QUEUE).len(), 1);
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_cuts_requeue_hold_short() {
    let harness = Harness::with_topology(
        Topology::direct(EXCHANGE).bind_queue(QUEUE),
        chain(&[FakeTransport::failing("resend")], 5),
        |c| {
            c.retry.max_retries = 1;
            c.requeue_delay = Duration::from_secs(60);
        },
    )
    .await;
    let raw = request("r1");
    harness.broker.enqueue(QUEUE, raw.clone());

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(harness.pipeline.clone().run(shutdown.clone()));
    while harness.broker.events().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let stopping = Instant::now();
    shutdown.cancel();
    consumer.await.unwrap().unwrap();

    assert!(Instant::now() - stopping < Duration::from_secs(1));
    assert_eq!(harness.requeued(), 1);
    assert_eq!(harness.broker.messages(QUEUE), vec![raw]);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_aborted_after_grace_is_delivered_on_restart() {
    let transport = FakeTransport::slow("resend", Duration::from_secs(30));
    let harness = Harness::new(chain(&[transport.clone()], 5), |c| {
        c.shutdown_grace = Duration::from_secs(1)
    })
    .await;
    harness.broker.enqueue(QUEUE, request("r1"));

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(harness.pipeline.clone().run(shutdown.clone()));
    while transport.call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // The send outlasts the grace period and is aborted
    shutdown.cancel();
    consumer.await.unwrap().unwrap();

    assert_eq!(harness.acked(), 0);
    assert_eq!(harness.broker.unacked_count(), 1);
    assert!(!harness.dedup.is_marked("idempotency:r1:0"));

    // Next start recovers it and sends again instead of acking it as a duplicate
    harness.run_until(|h| h.acked() == 1).await;
    assert_eq!(transport.call_count(), 2);
    assert!(harness.dedup.is_marked("idempotency:r1:0"));
    assert_eq!(harness.broker.unacked_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_back_off() {
    let broker = Arc::new(UnreachableBroker::default());
    let mut config = PipelineConfig::new(EXCHANGE, QUEUE, DLQ, "noreply@example.com");
    config.error_backoff = Duration::from_secs(2);
    let pipeline = Arc::new(DeliveryPipeline::new(
        broker.clone(),
        Arc::new(MemoryDedupStore::default()),
        Arc::new(chain(&[FakeTransport::succeeding("resend")], 5)),
        config,
    ));

    let shutdown = CancellationToken::new();
    let consumer = tokio::spawn(pipeline.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(9_000)).await;
    shutdown.cancel();
    consumer.await.unwrap().unwrap();

    // Attempts at 0, 2, 4, 6 and 8 seconds
    assert_eq!(broker.receives.load(Ordering::SeqCst), 5);
}
