//! Reliable queues on Redis lists.
//!
//! Layout:
//! - `courier:exchange:{name}`: hash of routing key → queue list key
//! - `courier:queue:{name}`: the queue; producers `LPUSH`, consumers take from the right
//! - `courier:queue:{name}:unacked:{consumer}`: messages taken but not yet settled
//!
//! `receive` moves a message into the unacknowledged list with a single `BLMOVE`,
//! so a crash between dequeue and ack leaves it there for `recover` to put back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};

use crate::{Broker, BrokerError, Delivery, PublishOptions, Topology};

const KEY_PREFIX: &str = "courier";

/// Route one message through an exchange hash; returns 1 when routed, 0 otherwise.
const ROUTE_SCRIPT: &str = r#"
local queue = redis.call('HGET', KEYS[1], ARGV[1])
if not queue then
    return 0
end
redis.call('LPUSH', queue, ARGV[2])
return 1
"#;

/// Drop a message from the unacknowledged list and, if it was there, put it back
/// at the consuming end of its queue.
const REQUEUE_SCRIPT: &str = r#"
local removed = redis.call('LREM', KEYS[1], 1, ARGV[1])
if removed > 0 then
    redis.call('RPUSH', KEYS[2], ARGV[1])
end
return removed
"#;

/// Redis-backed broker for one consumer identity.
pub struct RedisBroker {
    /// Regular commands (publish, ack, nack, declare).
    commands: ConnectionManager,
    /// `BLMOVE` only; blocking on the shared connection would stall every other command.
    blocking: ConnectionManager,
    consumer_id: String,
    next_tag: AtomicU64,
    route: Script,
    requeue: Script,
}

impl RedisBroker {
    /// Connect to `redis_url` as `consumer_id`.
    ///
    /// `consumer_id` must be stable across restarts of the same worker for `recover`
    /// to find what the previous process left behind.
    pub async fn connect(redis_url: &str, consumer_id: &str) -> Result<Self, BrokerError> {
        let client = Client::open(redis_url)?;
        let commands = ConnectionManager::new(client.clone()).await?;
        let blocking = ConnectionManager::new(client).await?;

        tracing::info!(consumer_id, "Connected to Redis broker");

        Ok(Self {
            commands,
            blocking,
            consumer_id: consumer_id.to_string(),
            next_tag: AtomicU64::new(1),
            route: Script::new(ROUTE_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
        })
    }

    fn exchange_key(exchange: &str) -> String {
        format!("{KEY_PREFIX}:exchange:{exchange}")
    }

    fn queue_key(queue: &str) -> String {
        format!("{KEY_PREFIX}:queue:{queue}")
    }

    fn unacked_key(&self, queue: &str) -> String {
        format!("{KEY_PREFIX}:queue:{queue}:unacked:{}", self.consumer_id)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let exchange_key = Self::exchange_key(&topology.exchange);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for binding in &topology.bindings {
            pipe.cmd("HSET")
                .arg(&exchange_key)
                .arg(&binding.routing_key)
                .arg(Self::queue_key(&binding.queue))
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        tracing::info!(
            exchange = %topology.exchange,
            bindings = topology.bindings.len(),
            "Broker topology declared"
        );
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut conn = self.commands.clone();
        let unacked_key = self.unacked_key(queue);
        let queue_key = Self::queue_key(queue);

        // Newest first from the left, each pushed onto the consuming end, so the
        // oldest unacknowledged message is the next one received.
        let mut moved = 0;
        loop {
            let message: Option<Vec<u8>> = redis::cmd("LMOVE")
                .arg(&unacked_key)
                .arg(&queue_key)
                .arg("LEFT")
                .arg("RIGHT")
                .query_async(&mut conn)
                .await?;
            if message.is_none() {
                break;
            }
            moved += 1;
        }

        if moved > 0 {
            tracing::debug!(queue, moved, "Moved unacknowledged messages back to queue");
        }
        Ok(moved)
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut conn = self.blocking.clone();

        // BLMOVE treats 0 as "block forever"; keep the wait strictly positive.
        let timeout_secs = wait.as_secs_f64().max(0.01);

        let message: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(Self::queue_key(queue))
            .arg(self.unacked_key(queue))
            .arg("RIGHT")
            .arg("LEFT")
            .arg(timeout_secs)
            .query_async(&mut conn)
            .await?;

        Ok(message.map(|payload| Delivery {
            tag: self.next_tag.fetch_add(1, Ordering::Relaxed),
            queue: queue.to_string(),
            payload,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();

        let removed: i64 = redis::cmd("LREM")
            .arg(self.unacked_key(&delivery.queue))
            .arg(1)
            .arg(&delivery.payload)
            .query_async(&mut conn)
            .await?;

        if removed == 0 {
            tracing::warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                "Ack for a message that is no longer unacknowledged"
            );
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let unacked_key = self.unacked_key(&delivery.queue);

        let removed: i64 = if requeue {
            self.requeue
                .key(&unacked_key)
                .key(Self::queue_key(&delivery.queue))
                .arg(&delivery.payload)
                .invoke_async(&mut conn)
                .await?
        } else {
            redis::cmd("LREM")
                .arg(&unacked_key)
                .arg(1)
                .arg(&delivery.payload)
                .query_async(&mut conn)
                .await?
        };

        if removed == 0 {
            tracing::warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                requeue,
                "Nack for a message that is no longer unacknowledged"
            );
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        // List entries live as long as the Redis dataset does; durability follows the
        // server's persistence settings, so there is nothing per-message to set.
        _options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        let mut conn = self.commands.clone();

        let routed: i64 = self
            .route
            .key(Self::exchange_key(exchange))
            .arg(routing_key)
            .arg(payload)
            .invoke_async(&mut conn)
            .await?;

        if routed == 0 {
            tracing::warn!(exchange, routing_key, "Unroutable message dropped");
        }
        Ok(routed > 0)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.commands.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
