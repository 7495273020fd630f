//! Publish one test delivery request onto the live queue.
//!
//! ## Usage
//!
//! ```bash
//! # Defaults: a text email to test@example.com with a fresh request id
//! cargo run --bin courier-enqueue
//!
//! # Reuse a request id to watch deduplication
//! ENQUEUE_TO=me@example.com ENQUEUE_REQUEST_ID=test0004 cargo run --bin courier-enqueue
//! ```

use courier_broker::{PublishOptions, Topology};
use courier_common::config::AppConfig;
use courier_common::telemetry;
use courier_common::types::DeliveryRequest;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    telemetry::init("courier_enqueue=info,courier_broker=info", config.log_json);

    let request = DeliveryRequest {
        request_id: std::env::var("ENQUEUE_REQUEST_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
        retry_count: 0,
        to_email: std::env::var("ENQUEUE_TO").unwrap_or_else(|_| "test@example.com".to_string()),
        subject: std::env::var("ENQUEUE_SUBJECT").unwrap_or_else(|_| "Your order is ready".to_string()),
        text_body: Some(
            std::env::var("ENQUEUE_TEXT")
                .unwrap_or_else(|_| "Your pizza is on its way.".to_string()),
        ),
        html_body: std::env::var("ENQUEUE_HTML").ok(),
        extra: serde_json::Map::new(),
    };
    let payload = serde_json::to_vec(&request)?;

    // Producers use their own identity; they never consume.
    let broker = courier_broker::connect(&config.broker_url, "courier-enqueue", 1).await?;
    broker
        .declare(
            &Topology::direct(&config.exchange)
                .bind_queue(&config.queue)
                .bind_queue(&config.dead_letter_queue),
        )
        .await?;

    let routed = broker
        .publish(
            &config.exchange,
            &config.queue,
            &payload,
            PublishOptions::persistent(),
        )
        .await?;
    if !routed {
        anyhow::bail!("message was not routed to {}", config.queue);
    }

    tracing::info!(
        request_id = %request.request_id,
        queue = %config.queue,
        "Delivery request enqueued"
    );
    Ok(())
}
