//! Transport providers: "send one email, succeed or fail with a typed error".
//!
//! The provider chain only sees this trait; wire formats stay inside each module.

pub mod resend;
pub mod smtp;

use async_trait::async_trait;
use thiserror::Error;

use courier_common::types::OutboundEmail;

pub use resend::ResendTransport;
pub use smtp::{SmtpConfig, SmtpTls, SmtpTransport};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider rejected the message with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("SMTP {code} after {stage}: {message}")]
    Smtp {
        stage: &'static str,
        code: u16,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable provider name used in logs and delivery results (e.g., "resend").
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError>;
}
