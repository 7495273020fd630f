//! RabbitMQ over AMQP 0-9-1.
//!
//! Consuming happens on one channel with a `basic.qos` prefetch, publishing on a second
//! channel in confirm mode. Publishes are `mandatory`, so a message no binding matches
//! comes back with its confirm and `publish` reports `false`.
//!
//! RabbitMQ redelivers whatever a closed connection left unacknowledged, so `recover`
//! has nothing to move.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;

use crate::{Broker, BrokerError, Delivery, PublishOptions, Topology};

/// AMQP `delivery-mode` for messages written to disk.
const PERSISTENT: u8 = 2;

pub struct AmqpBroker {
    connection: Connection,
    consume: Channel,
    publish: Channel,
    consumer_tag: String,
    /// One consumer per queue, created on the first `receive`
    consumers: Mutex<HashMap<String, Consumer>>,
}

impl AmqpBroker {
    /// Connect to `amqp_url` and allow at most `prefetch` unacknowledged deliveries.
    pub async fn connect(
        amqp_url: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<Self, BrokerError> {
        let properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current())
            .with_reactor(tokio_reactor_trait::Tokio);
        let connection = Connection::connect(amqp_url, properties).await?;

        let consume = connection.create_channel().await?;
        consume
            .basic_qos(prefetch, BasicQosOptions::default())
            .await?;
        let publish = connection.create_channel().await?;
        publish
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        tracing::info!(consumer_tag, prefetch, "Connected to AMQP broker");

        Ok(Self {
            connection,
            consume,
            publish,
            consumer_tag: consumer_tag.to_string(),
            consumers: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare(&self, topology: &Topology) -> Result<(), BrokerError> {
        self.consume
            .exchange_declare(
                &topology.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for binding in &topology.bindings {
            self.consume
                .queue_declare(
                    &binding.queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            self.consume
                .queue_bind(
                    &binding.queue,
                    &topology.exchange,
                    &binding.routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }

    async fn recover(&self, queue: &str) -> Result<usize, BrokerError> {
        tracing::debug!(queue, "Unacknowledged deliveries are redelivered by RabbitMQ");
        Ok(0)
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        let mut consumers = self.consumers.lock().await;
        let consumer = match consumers.entry(queue.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let consumer = self
                    .consume
                    .basic_consume(
                        queue,
                        &format!("{}:{queue}", self.consumer_tag),
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await?;
                entry.insert(consumer)
            }
        };

        let next = tokio::time::timeout(wait, consumer.next()).await;
        match next {
            Err(_) => Ok(None),
            Ok(Some(Ok(delivery))) => Ok(Some(Delivery {
                tag: delivery.delivery_tag,
                queue: queue.to_string(),
                payload: delivery.data,
            })),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => {
                // Cancelled by the server; the next call subscribes again
                consumers.remove(queue);
                Err(BrokerError::ConsumerClosed(queue.to_string()))
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.consume
            .basic_ack(delivery.tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        self.consume
            .basic_nack(
                delivery.tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<bool, BrokerError> {
        let mut properties = BasicProperties::default();
        if options.persistent {
            properties = properties.with_delivery_mode(PERSISTENT);
        }

        let confirmation = self
            .publish
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                payload,
                properties,
            )
            .await?
            .await?;

        match confirmation {
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(true),
            Confirmation::Ack(Some(returned)) => {
                tracing::warn!(
                    exchange,
                    routing_key,
                    reply_code = returned.reply_code,
                    "Unroutable message returned"
                );
                Ok(false)
            }
            Confirmation::Nack(_) => {
                tracing::warn!(exchange, routing_key, "Publish was not confirmed");
                Ok(false)
            }
        }
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        if self.connection.status().connected() {
            Ok(())
        } else {
            Err(BrokerError::Disconnected)
        }
    }
}
