use thiserror::Error;

/// Why a raw broker payload could not become a `DeliveryRequest`.
///
/// Always fatal for the message: retrying cannot make malformed input well-formed.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not a valid delivery request: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("request_id is missing or empty")]
    MissingRequestId,

    #[error("request {0} has neither text_body nor html_body")]
    MissingBody(String),
}

/// Errors raised while assembling the worker.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Configuration error: {0}")]
    Config(String),
}
