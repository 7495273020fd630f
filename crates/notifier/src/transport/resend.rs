//! Primary transport: the Resend HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use courier_common::types::OutboundEmail;

use super::{Transport, TransportError};

/// Upper bound on one API call.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Request body for `POST /emails`.
#[derive(Debug, Serialize)]
struct SendEmailBody<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
}

pub struct ResendTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl ResendTransport {
    pub fn new(api_url: &str, api_key: impl Into<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/emails", api_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl Transport for ResendTransport {
    fn name(&self) -> &str {
        "resend"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        let body = SendEmailBody {
            from: &email.from,
            to: [&email.to],
            subject: &email.subject,
            text: email.text.as_deref(),
            html: email.html.as_deref(),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        tracing::debug!(
            request_id = %email.request_id,
            status = status.as_u16(),
            "Resend accepted message"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    fn email() -> OutboundEmail {
        OutboundEmail {
            request_id: "r1".to_string(),
            from: "noreply@example.com".to_string(),
            to: "user@example.com".to_string(),
            subject: "Pizza".to_string(),
            text: None,
            html: Some("<p>ready</p>".to_string()),
        }
    }

    /// Accept one HTTP request, answer with `status` and `body`, and return the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];

            // Read headers, then exactly Content-Length bytes of body
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    #[tokio::test]
    async fn test_send_posts_json_with_bearer_key() {
        let (url, server) = serve_once("200 OK", r#"{"id":"abc"}"#).await;
        let transport = ResendTransport::new(&format!("{url}/"), "re_test_key").unwrap();

        transport.send(&email()).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /emails HTTP/1.1"));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("authorization: bearer re_test_key")
        );

        let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
        let json: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "from": "noreply@example.com",
                "to": ["user@example.com"],
                "subject": "Pizza",
                "html": "<p>ready</p>"
            })
        );
    }

    #[tokio::test]
    async fn test_non_success_status_is_rejected() {
        let (url, server) = serve_once("422 Unprocessable Entity", r#"{"message":"bad from"}"#).await;
        let transport = ResendTransport::new(&url, "k").unwrap();

        let err = transport.send(&email()).await.unwrap_err();
        match err {
            TransportError::Rejected { status, body } => {
                assert_eq!(status, 422);
                assert!(body.contains("bad from"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_http_error() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let transport = ResendTransport::new(&url, "k").unwrap();
        assert!(matches!(
            transport.send(&email()).await,
            Err(TransportError::Http(_))
        ));
    }
}
