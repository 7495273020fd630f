use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use courier_broker::{BrokerError, Topology};
use courier_common::config::AppConfig;
use courier_common::{redis_pool, telemetry};
use courier_notifier::circuit_breaker::CircuitBreakerConfig;
use courier_notifier::dedup::RedisDedupStore;
use courier_notifier::pipeline::{DeliveryPipeline, PipelineConfig};
use courier_notifier::provider::ProviderChain;
use courier_notifier::retry::RetryPolicy;
use courier_notifier::startup::wait_for;
use courier_notifier::transport::{ResendTransport, SmtpConfig, SmtpTls, SmtpTransport};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = AppConfig::from_env()?;
    telemetry::init("courier_notifier=info,courier_broker=info", config.log_json);
    config.validate()?;

    tracing::info!(worker_id = %config.worker_id, "Courier notifier starting...");

    let sender = config
        .email_from
        .clone()
        .ok_or_else(|| anyhow::anyhow!("EMAIL_FROM must be set"))?;
    let chain = Arc::new(build_chain(&config, &sender)?);

    let wait_interval = Duration::from_millis(config.broker_wait_interval_ms);

    // Dedup store
    let redis = wait_for("redis", config.broker_wait_retries, wait_interval, || {
        redis_pool::create_redis_pool(&config.redis_url)
    })
    .await?;
    let dedup = Arc::new(RedisDedupStore::new(
        redis,
        Duration::from_secs(config.dedup_ttl_secs),
    ));

    // Broker, then the exchange and both queues
    let (broker_url, worker_id) = (config.broker_url.as_str(), config.worker_id.as_str());
    let prefetch = config.worker_concurrency;
    let broker = wait_for(
        "broker",
        config.broker_wait_retries,
        wait_interval,
        move || async move {
            let broker = courier_broker::connect(broker_url, worker_id, prefetch).await?;
            broker.ping().await?;
            Ok::<_, BrokerError>(broker)
        },
    )
    .await?;
    broker
        .declare(
            &Topology::direct(&config.exchange)
                .bind_queue(&config.queue)
                .bind_queue(&config.dead_letter_queue),
        )
        .await?;
    tracing::info!(
        exchange = %config.exchange,
        queue = %config.queue,
        dead_letter_queue = %config.dead_letter_queue,
        "Broker topology asserted"
    );

    let pipeline = Arc::new(DeliveryPipeline::new(
        broker,
        dedup,
        chain,
        PipelineConfig {
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_millis(config.base_delay_ms),
            },
            dedup_fail_open: config.dedup_fail_open,
            concurrency: config.worker_concurrency,
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
            error_backoff: Duration::from_millis(config.broker_error_backoff_ms),
            ..PipelineConfig::new(
                &config.exchange,
                &config.queue,
                &config.dead_letter_queue,
                sender,
            )
        },
    ));

    // Run with graceful shutdown on Ctrl+C / SIGTERM
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Received shutdown signal, stopping gracefully...");
            shutdown.cancel();
        }
    });

    if let Err(e) = pipeline.run(shutdown).await {
        tracing::error!(error = %e, "Delivery pipeline exited with error");
        return Err(e.into());
    }

    tracing::info!("Courier notifier stopped.");
    Ok(())
}

/// Assemble transports in `PROVIDERS` order, skipping any without credentials.
fn build_chain(config: &AppConfig, sender: &str) -> anyhow::Result<ProviderChain> {
    let breaker = CircuitBreakerConfig {
        failure_threshold: config.failure_threshold,
        recovery_time: Duration::from_millis(config.recovery_time_ms),
    };

    let mut chain = ProviderChain::new();
    for name in &config.providers {
        match name.as_str() {
            "resend" => match &config.resend_api_key {
                Some(api_key) => {
                    let transport = ResendTransport::new(&config.resend_api_url, api_key.clone())?;
                    chain = chain.with_provider(Arc::new(transport), breaker);
                }
                None => tracing::warn!("RESEND_API_KEY not set, skipping resend provider"),
            },
            "smtp" => match &config.smtp_host {
                Some(host) => {
                    let credentials = config.smtp_user.clone().zip(config.smtp_pass.clone());
                    let tls: SmtpTls = config.smtp_tls.parse().map_err(anyhow::Error::msg)?;
                    if config.smtp_allow_insecure_auth && credentials.is_some() {
                        tracing::warn!("SMTP_ALLOW_INSECURE_AUTH set, credentials may travel unencrypted");
                    }
                    let transport = SmtpTransport::new(SmtpConfig {
                        host: host.clone(),
                        port: config.smtp_port,
                        credentials,
                        helo_name: sender.rsplit('@').next().unwrap_or("localhost").to_string(),
                        timeout: Duration::from_millis(config.smtp_timeout_ms),
                        tls,
                        allow_insecure_auth: config.smtp_allow_insecure_auth,
                    })?;
                    chain = chain.with_provider(Arc::new(transport), breaker);
                }
                None => tracing::warn!("SMTP_HOST not set, skipping smtp provider"),
            },
            other => anyhow::bail!("unknown provider in PROVIDERS: {other}"),
        }
    }

    if chain.is_empty() {
        anyhow::bail!("no usable email provider; configure RESEND_API_KEY or SMTP_HOST");
    }
    tracing::info!(providers = ?chain.provider_names(), "Email providers configured");
    Ok(chain)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
