use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DecodeError;

/// Wire field carrying the attempt counter.
pub const RETRY_COUNT_FIELD: &str = "retry_count";

/// A delivery request as consumed from the live queue.
///
/// Fields the worker does not understand are kept in `extra` and survive
/// re-publication untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub request_id: String,
    #[serde(default)]
    pub retry_count: u32,
    pub to_email: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_body: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeliveryRequest {
    /// Decode and validate a raw payload.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let request: Self = serde_json::from_slice(raw)?;

        if request.request_id.trim().is_empty() {
            return Err(DecodeError::MissingRequestId);
        }
        if request.text_body.is_none() && request.html_body.is_none() {
            return Err(DecodeError::MissingBody(request.request_id));
        }

        Ok(request)
    }

    /// Render the payload for the next attempt: `raw` with only `retry_count` replaced.
    ///
    /// Works on the raw JSON object rather than on `self` so that every other field,
    /// known or not, is carried over exactly as the producer wrote it.
    pub fn retry_payload(raw: &[u8], next_retry: u32) -> Result<Vec<u8>, DecodeError> {
        let mut object: Map<String, Value> = match serde_json::from_slice(raw)? {
            Value::Object(object) => object,
            _ => return Err(DecodeError::NotAnObject),
        };
        object.insert(RETRY_COUNT_FIELD.to_string(), Value::from(next_retry));

        Ok(serde_json::to_vec(&Value::Object(object))?)
    }
}

/// A single email handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEmail {
    /// Carried for tracing only; transports must not put it on the wire.
    pub request_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
}

impl OutboundEmail {
    pub fn from_request(request: &DeliveryRequest, from: &str) -> Self {
        Self {
            request_id: request.request_id.clone(),
            from: from.to_string(),
            to: request.to_email.clone(),
            subject: request.subject.clone(),
            text: request.text_body.clone(),
            html: request.html_body.clone(),
        }
    }
}
