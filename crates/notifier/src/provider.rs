//! Ordered list of transports, each behind its own circuit breaker.
//!
//! `deliver` tries providers in priority order and stops at the first success.
//! A provider whose circuit is open is skipped without being called.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use courier_common::types::OutboundEmail;

use crate::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
use crate::transport::{Transport, TransportError};

/// Why one provider did not deliver.
#[derive(Debug, Error)]
pub enum ProviderFailure {
    #[error("{provider}: circuit open, next trial in {retry_in:?}")]
    CircuitOpen { provider: String, retry_in: Duration },

    #[error("{provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("no email providers configured")]
    NoProviders,

    #[error("all {attempted} providers failed, last: {last}")]
    AllProvidersFailed {
        attempted: usize,
        last: ProviderFailure,
    },
}

/// Successful delivery through one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub provider: String,
}

struct ProviderSlot {
    transport: Arc<dyn Transport>,
    breaker: CircuitBreaker,
}

#[derive(Default)]
pub struct ProviderChain {
    slots: Vec<ProviderSlot>,
}

impl ProviderChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a provider at the lowest priority so far.
    pub fn with_provider(
        mut self,
        transport: Arc<dyn Transport>,
        config: CircuitBreakerConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(transport.name(), config);
        self.slots.push(ProviderSlot { transport, breaker });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.slots.iter().map(|s| s.transport.name()).collect()
    }

    pub fn breaker(&self, provider: &str) -> Option<&CircuitBreaker> {
        self.slots
            .iter()
            .find(|s| s.transport.name() == provider)
            .map(|s| &s.breaker)
    }

    pub async fn deliver(&self, email: &OutboundEmail) -> Result<Delivered, ChainError> {
        let mut last = None;

        for slot in &self.slots {
            let provider = slot.transport.name();
            let result = slot
                .breaker
                .execute(|| slot.transport.send(email))
                .await;

            let failure = match result {
                Ok(()) => {
                    tracing::info!(
                        request_id = %email.request_id,
                        provider,
                        "Email delivered"
                    );
                    return Ok(Delivered {
                        provider: provider.to_string(),
                    });
                }
                Err(BreakerError::Open { retry_in }) => {
                    tracing::debug!(
                        request_id = %email.request_id,
                        provider,
                        retry_in_ms = retry_in.as_millis() as u64,
                        "Skipping provider with open circuit"
                    );
                    ProviderFailure::CircuitOpen {
                        provider: provider.to_string(),
                        retry_in,
                    }
                }
                Err(BreakerError::Inner(source)) => {
                    tracing::warn!(
                        request_id = %email.request_id,
                        provider,
                        state = %slot.breaker.state(),
                        error = %source,
                        "Provider failed, trying next"
                    );
                    ProviderFailure::Transport {
                        provider: provider.to_string(),
                        source,
                    }
                }
            };
            last = Some(failure);
        }

        match last {
            Some(last) => Err(ChainError::AllProvidersFailed {
                attempted: self.slots.len(),
                last,
            }),
            None => Err(ChainError::NoProviders),
        }
    }
}
