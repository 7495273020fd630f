//! In-process broker with the same settle semantics as [`crate::RedisBroker`].
//!
//! Every settle and publish is appended to an event log so tests can assert on
//! exactly what the pipeline did with each message.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{Broker, BrokerError, Delivery, PublishOptions, Topology};

/// Something the broker was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Acked {
        queue: String,
        payload: Vec<u8>,
    },
    /// `nack` without requeue.
    Rejected {
        queue: String,
        payload: Vec<u8>,
    },
    /// `nack` with requeue.
    Requeued {
        queue: String,
        payload: Vec<u8>,
    },
    Published {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        persistent: bool,
        routed: bool,
    },
}

#[derive(Debug, Default)]
struct State {
    /// (exchange, routing key) → queue
    bindings: HashMap<(String, String), String>,
    exchanges: Vec<String>,
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    unacked: HashMap<u64, Delivery>,
    next_tag: u64,
    events: Vec<BrokerEvent>,
}

#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put `payload` straight onto `queue`, bypassing exchanges.
    pub fn enqueue(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        self.state
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.into());
        self.arrivals.notify_waiters();
    }

    /// Messages currently waiting on `queue`, oldest first.
    pub fn messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of deliveries handed out and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.state.lock().unacked.len()
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    fn settle(&self, delivery: &Delivery) -> Option<Delivery> {
        let removed = self.state.lock().unacked.remove(&delivery.tag);
        if removed.is_none() {
            tracing::warn!(
                queue = %delivery.queue,
                tag = delivery.tag,
                "Settling a delivery that is not outstanding"
            );
        }
        removed
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if !state.exchanges.contains(&topology.exchange) {
            state.exchanges.push(topology.exchange.clone());
        }
        for binding in &topology.bindings {
            state.bindings.insert(
                (topology.exchange.clone(), binding.routing_key.clone()),
                binding.queue.clone(),
            );
            state.queues.entry(binding.queue.clone()).or_default();
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        let mut state = self.state.lock();

        let mut tags: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, d)| d.queue == queue)
            .map(|(tag, _)| *tag)
            .collect();
        // Newest first onto the front leaves the oldest at the head.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let moved = tags.len();
        for tag in tags {
            if let Some(delivery) = state.unacked.remove(&tag) {
                state
                    .queues
                    .entry(delivery.queue)
                    .or_default()
                    .push_front(delivery.payload);
            }
        }
        drop(state);

        if moved > 0 {
            self.arrivals.notify_waiters();
        }
        Ok(moved)
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before looking, so an enqueue between the check and
            // the await still wakes us.
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            {
                let mut state = self.state.lock();
                let payload = state.queues.get_mut(queue).and_then(|q| q.pop_front());
                if let Some(payload) = payload {
                    state.next_tag += 1;
                    let delivery = Delivery {
                        tag: state.next_tag,
                        queue: queue.to_string(),
                        payload,
                    };
                    state.unacked.insert(delivery.tag, delivery.clone());
                    return Ok(Some(delivery));
                }
            }

            if tokio::time::timeout_at(deadline, arrival).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        if self.settle(delivery).is_some() {
            self.state.lock().events.push(BrokerEvent::Acked {
                queue: delivery.queue.clone(),
                payload: delivery.payload.clone(),
            });
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let Some(settled) = self.settle(delivery) else {
            return Ok(());
        };

        let mut state = self.state.lock();
        if requeue {
            state.events.push(BrokerEvent::Requeued {
                queue: settled.queue.clone(),
                payload: settled.payload.clone(),
            });
            state
                .queues
                .entry(settled.queue)
                .or_default()
                .push_front(settled.payload);
            drop(state);
            self.arrivals.notify_waiters();
        } else {
            state.events.push(BrokerEvent::Rejected {
                queue: settled.queue,
                payload: settled.payload,
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        let mut state = self.state.lock();
        if !state.exchanges.iter().any(|e| e == exchange) {
            return Err(BrokerError::UnknownExchange(exchange.to_string()));
        }

        let target = state
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .cloned();
        let routed = target.is_some();

        state.events.push(BrokerEvent::Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: payload.to_vec(),
            persistent: options.persistent,
            routed,
        });
        if let Some(queue) = target {
            state
                .queues
                .entry(queue)
                .or_default()
                .push_back(payload.to_vec());
        }
        drop(state);

        if routed {
            self.arrivals.notify_waiters();
        } else {
            tracing::warn!(exchange, routing_key, "Unroutable message dropped");
        }
        Ok(routed)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
