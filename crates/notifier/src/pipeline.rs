//! Delivery pipeline: one dequeue-to-ack cycle per message.
//!
//! ```text
//! receive ─▶ decode ─▶ dedup ─▶ provider chain ─▶ ack
//!              │          │            │
//!              ▼          ▼            ▼ failed
//!         nack(drop)   ack (dup)   retry decision
//!                                   ├─ Retry: backoff, re-publish retry_count+1, ack
//!                                   └─ DeadLetter: publish raw bytes to DLQ, ack
//! ```
//!
//! Every received message is settled exactly once, except when shutdown interrupts a
//! backoff timer or outlasts the grace period: that message is left unacknowledged for
//! the broker to hand back, and its dedup mark is released so the next run delivers it.
//!
//! A message that is requeued (dedup store down with fail-closed, retry or dead-letter
//! publish failed) is held for `requeue_delay` first, so a broken dependency costs one
//! pass per slot per delay instead of a busy loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use courier_broker::{Broker, BrokerError, Delivery, PublishOptions};
use courier_common::error::DecodeError;
use courier_common::types::{DeliveryRequest, OutboundEmail};

use crate::dedup::{DedupStore, attempt_key};
use crate::provider::ProviderChain;
use crate::retry::{RetryDecision, RetryPolicy};

/// How long one `receive` call waits before the loop re-checks for shutdown.
const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub exchange: String,
    /// Live queue; also the routing key for retry re-publishes
    pub queue: String,
    /// Dead-letter queue; also its routing key
    pub dead_letter_queue: String,
    /// `From` address for every outbound email
    pub sender: String,
    pub retry: RetryPolicy,
    /// Proceed with delivery when the dedup store cannot be reached
    pub dedup_fail_open: bool,
    /// Maximum messages held unacknowledged at once
    pub concurrency: usize,
    /// Time in-flight attempts get after shutdown before they are aborted
    pub shutdown_grace: Duration,
    pub receive_wait: Duration,
    /// Pause after a failed `receive` before the loop asks the broker again
    pub error_backoff: Duration,
    /// How long a message that cannot be handled now is held before it is requeued
    pub requeue_delay: Duration,
}

impl PipelineConfig {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        dead_letter_queue: impl Into<String>,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            sender: sender.into(),
            retry: RetryPolicy::default(),
            dedup_fail_open: true,
            concurrency: 16,
            shutdown_grace: Duration::from_secs(10),
            receive_wait: DEFAULT_RECEIVE_WAIT,
            error_backoff: Duration::from_secs(2),
            requeue_delay: Duration::from_secs(5),
        }
    }
}

/// How one message left the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A provider accepted the email; acked.
    Delivered { provider: String },
    /// This attempt was already seen; acked without delivery.
    Duplicate,
    /// Malformed payload; dropped without retry or dead-letter.
    Rejected,
    /// Next attempt published after the backoff; acked.
    Retried { next_retry: u32, delay: Duration },
    /// Attempts exhausted; raw payload published to the dead-letter queue; acked.
    DeadLettered,
    /// Could not be handled now; handed back to the head of the queue.
    Requeued,
    /// Shutdown interrupted the backoff; left unacknowledged.
    Abandoned,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("failed to build retry payload: {0}")]
    Encode(DecodeError),
}

pub struct DeliveryPipeline {
    broker: Arc<dyn Broker>,
    dedup: Arc<dyn DedupStore>,
    chain: Arc<ProviderChain>,
    config: PipelineConfig,
    /// Attempt keys marked in the dedup store whose delivery has not settled yet
    in_flight: Mutex<HashSet<String>>,
}

impl DeliveryPipeline {
    pub fn new(
        broker: Arc<dyn Broker>,
        dedup: Arc<dyn DedupStore>,
        chain: Arc<ProviderChain>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            broker,
            dedup,
            chain,
            config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn chain(&self) -> &ProviderChain {
        &self.chain
    }

    /// Consume the live queue until `shutdown` is cancelled.
    ///
    /// Messages left unacknowledged by a previous run of this consumer are put back on
    /// the queue first. On shutdown no further message is taken; running attempts get
    /// `shutdown_grace` to finish and are aborted after that.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), PipelineError> {
        let recovered = self.broker.recover(&self.config.queue).await?;
        if recovered > 0 {
            tracing::info!(
                queue = %self.config.queue,
                recovered,
                "Recovered unacknowledged messages"
            );
        }

        let permits = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        tracing::info!(
            queue = %self.config.queue,
            concurrency = self.config.concurrency,
            providers = ?self.chain.provider_names(),
            "Delivery pipeline started"
        );

        loop {
            while let Some(joined) = tasks.try_join_next() {
                log_task_result(joined);
            }

            // The permit is taken before receiving so the broker never hands out
            // more messages than there are free slots.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = self.broker.receive(&self.config.queue, self.config.receive_wait) => received,
            };

            match received {
                Ok(Some(delivery)) => {
                    let pipeline = self.clone();
                    let token = shutdown.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        pipeline.handle(delivery, &token).await
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        queue = %self.config.queue,
                        error = %e,
                        "Failed to receive from broker"
                    );
                    drop(permit);
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        tracing::info!(
            in_flight = tasks.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Shutdown requested, draining in-flight deliveries"
        );

        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_task_result(joined),
                    None => break,
                },
                _ = &mut grace => {
                    tracing::warn!(
                        remaining = tasks.len(),
                        "Shutdown grace period elapsed, aborting deliveries"
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    self.release_stranded().await;
                    break;
                }
            }
        }

        tracing::info!("Delivery pipeline stopped");
        Ok(())
    }

    /// Run one delivery through decode, dedup, delivery and retry or dead-letter,
    /// then settle it with the broker.
    ///
    /// While the attempt runs its key is tracked as in flight, so an abort at the end
    /// of the grace period can still release the mark.
    pub async fn handle(
        &self,
        delivery: Delivery,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let request = match DeliveryRequest::decode(&delivery.payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(
                    queue = %delivery.queue,
                    bytes = delivery.payload.len(),
                    error = %e,
                    "Rejecting malformed message"
                );
                self.broker.nack(&delivery, false).await?;
                return Ok(Outcome::Rejected);
            }
        };

        let key = attempt_key(&request);
        match self.dedup.check_and_mark(&key).await {
            Ok(true) => {
                tracing::info!(
                    request_id = %request.request_id,
                    retry_count = request.retry_count,
                    "Duplicate delivery attempt, skipping"
                );
                self.broker.ack(&delivery).await?;
                return Ok(Outcome::Duplicate);
            }
            Ok(false) => {}
            Err(e) if self.config.dedup_fail_open => {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Dedup store unavailable, delivering anyway"
                );
            }
            Err(e) => {
                tracing::warn!(
                    request_id = %request.request_id,
                    error = %e,
                    "Dedup store unavailable, requeueing"
                );
                return self.requeue_later(&delivery, shutdown).await;
            }
        }

        self.in_flight.lock().insert(key.clone());
        let outcome = self.attempt(&delivery, &request, &key, shutdown).await;
        self.in_flight.lock().remove(&key);
        outcome
    }

    async fn attempt(
        &self,
        delivery: &Delivery,
        request: &DeliveryRequest,
        key: &str,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let email = OutboundEmail::from_request(request, &self.config.sender);
        let failure = match self.chain.deliver(&email).await {
            Ok(delivered) => {
                self.broker.ack(delivery).await?;
                return Ok(Outcome::Delivered {
                    provider: delivered.provider,
                });
            }
            Err(e) => e,
        };

        match self.config.retry.decide(request.retry_count) {
            RetryDecision::DeadLetter => {
                tracing::error!(
                    request_id = %request.request_id,
                    retry_count = request.retry_count,
                    max_retries = self.config.retry.max_retries,
                    error = %failure,
                    "Delivery failed permanently, dead-lettering"
                );
                // Raw bytes, so the dead-lettered copy is exactly what was consumed
                self.publish_then_ack(
                    delivery,
                    key,
                    &self.config.dead_letter_queue,
                    &delivery.payload,
                    Outcome::DeadLettered,
                    shutdown,
                )
                .await
            }
            RetryDecision::Retry { next_retry, delay } => {
                tracing::warn!(
                    request_id = %request.request_id,
                    retry_count = request.retry_count,
                    next_retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "Delivery failed, scheduling retry"
                );
                let payload = DeliveryRequest::retry_payload(&delivery.payload, next_retry)
                    .map_err(PipelineError::Encode)?;

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.cancelled() => {
                        self.release(key).await;
                        tracing::warn!(
                            request_id = %request.request_id,
                            retry_count = request.retry_count,
                            "Shutdown during backoff, leaving message unacknowledged"
                        );
                        return Ok(Outcome::Abandoned);
                    }
                }

                self.publish_then_ack(
                    delivery,
                    key,
                    &self.config.queue,
                    &payload,
                    Outcome::Retried { next_retry, delay },
                    shutdown,
                )
                .await
            }
        }
    }

    async fn publish_then_ack(
        &self,
        delivery: &Delivery,
        key: &str,
        routing_key: &str,
        payload: &[u8],
        outcome: Outcome,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        let published = self
            .broker
            .publish(
                &self.config.exchange,
                routing_key,
                payload,
                PublishOptions::persistent(),
            )
            .await;

        match published {
            Ok(true) => {
                self.broker.ack(delivery).await?;
                Ok(outcome)
            }
            Ok(false) => {
                tracing::error!(
                    exchange = %self.config.exchange,
                    routing_key,
                    "Publish was not routed, requeueing original"
                );
                self.release(key).await;
                self.requeue_later(delivery, shutdown).await
            }
            Err(e) => {
                tracing::error!(
                    exchange = %self.config.exchange,
                    routing_key,
                    error = %e,
                    "Publish failed, requeueing original"
                );
                self.release(key).await;
                self.requeue_later(delivery, shutdown).await
            }
        }
    }

    /// Hold `delivery` for `requeue_delay`, then hand it back to the head of its queue.
    ///
    /// The slot stays occupied while waiting. Shutdown ends the wait early.
    async fn requeue_later(
        &self,
        delivery: &Delivery,
        shutdown: &CancellationToken,
    ) -> Result<Outcome, PipelineError> {
        tokio::select! {
            _ = tokio::time::sleep(self.config.requeue_delay) => {}
            _ = shutdown.cancelled() => {}
        }
        self.broker.nack(delivery, true).await?;
        Ok(Outcome::Requeued)
    }

    /// Release the marks of attempts that were aborted before they settled.
    async fn release_stranded(&self) {
        let stranded: Vec<String> = self.in_flight.lock().drain().collect();
        if stranded.is_empty() {
            return;
        }
        tracing::warn!(
            aborted = stranded.len(),
            "Releasing dedup marks of aborted deliveries"
        );
        for key in &stranded {
            self.release(key).await;
        }
    }

    /// Drop this attempt's dedup mark so the redelivered message is processed again.
    async fn release(&self, key: &str) {
        if let Err(e) = self.dedup.release(key).await {
            tracing::warn!(key, error = %e, "Failed to release dedup marker");
        }
    }
}

fn log_task_result(joined: Result<Result<Outcome, PipelineError>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(outcome)) => tracing::debug!(?outcome, "Delivery settled"),
        Ok(Err(e)) => tracing::error!(error = %e, "Delivery could not be settled"),
        Err(e) if e.is_cancelled() => {}
        Err(e) => tracing::error!(error = %e, "Delivery task panicked"),
    }
}
