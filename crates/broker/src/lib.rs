//! Message broker seam for the delivery worker.
//!
//! The worker treats the broker as an at-least-once channel: every received
//! message must end in exactly one `ack` or `nack`, and anything left
//! unacknowledged when the process dies comes back via `recover` on restart.
//!
//! Three implementations ship with the crate:
//! - [`AmqpBroker`]: RabbitMQ, durable direct exchange and queues
//! - [`RedisBroker`]: direct exchange + reliable queues on Redis lists (`BLMOVE`)
//! - [`MemoryBroker`]: in-process, with an event log for tests
//!
//! [`connect`] picks between the first two by URL scheme.

pub mod amqp;
pub mod memory;
pub mod redis_queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::amqp::AmqpBroker;
pub use crate::memory::{BrokerEvent, MemoryBroker};
pub use crate::redis_queue::RedisBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("exchange {0} has not been declared")]
    UnknownExchange(String),

    #[error("consumer on {0} was cancelled by the broker")]
    ConsumerClosed(String),

    #[error("broker connection is closed")]
    Disconnected,

    #[error("unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Connect to the broker `url` names.
///
/// `amqp://` and `amqps://` select [`AmqpBroker`] with `prefetch` as its `basic.qos`;
/// `redis://` and `rediss://` select [`RedisBroker`] under `consumer` as its identity.
pub async fn connect(
    url: &str,
    consumer: &str,
    prefetch: usize,
) -> Result<Arc<dyn Broker>, BrokerError> {
    let scheme = url.split_once("://").map(|(scheme, _)| scheme).unwrap_or_default();
    match scheme {
        "amqp" | "amqps" => {
            let prefetch = u16::try_from(prefetch).unwrap_or(u16::MAX);
            Ok(Arc::new(AmqpBroker::connect(url, consumer, prefetch).await?))
        }
        "redis" | "rediss" => Ok(Arc::new(RedisBroker::connect(url, consumer).await?)),
        _ => Err(BrokerError::UnsupportedScheme(scheme.to_string())),
    }
}

/// One message taken off a queue and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-local handle, unique for the lifetime of the broker instance.
    pub tag: u64,
    /// Queue the message was taken from.
    pub queue: String,
    /// Exact bytes the producer published.
    pub payload: Vec<u8>,
}

/// Per-publish flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to keep the message across its own restarts.
    pub persistent: bool,
}

impl PublishOptions {
    pub const fn persistent() -> Self {
        Self { persistent: true }
    }
}

/// A queue bound to an exchange under a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub queue: String,
    pub routing_key: String,
}

/// Exchange and bindings the worker asserts before consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// A direct exchange with no bindings yet.
    pub fn direct(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            bindings: Vec::new(),
        }
    }

    /// Bind `queue` under a routing key equal to its own name.
    pub fn bind_queue(mut self, queue: impl Into<String>) -> Self {
        let queue = queue.into();
        self.bindings.push(Binding {
            routing_key: queue.clone(),
            queue,
        });
        self
    }
}

/// The operations the delivery pipeline needs from a broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Create the exchange and its bindings. Idempotent.
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError>;

    /// Return this consumer's unacknowledged messages on `queue` to the head of the queue.
    ///
    /// Returns how many messages were moved.
    async fn recover(&self, queue: &str) -> Result<usize, BrokerError>;

    /// Wait up to `wait` for the next message on `queue`.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    /// Settle a delivery as done.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Settle a delivery as not done; `requeue` puts it back at the head of its queue,
    /// otherwise it is discarded.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Publish through `exchange`. Returns `false` when no binding matched `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError>;

    /// Cheap availability check.
    async fn ping(&self) -> Result<(), BrokerError>;
}
