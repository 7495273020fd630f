//! Fallback transport: a minimal SMTP client speaking to a relay.
//!
//! One connection per message: greeting, `EHLO`, `STARTTLS` plus a second `EHLO` when
//! the TLS policy calls for it, optional `AUTH PLAIN`, one envelope, `DATA`, `QUIT`.
//! The whole session runs under a single timeout.
//!
//! Credentials only travel over TLS unless `allow_insecure_auth` is set. Bodies are
//! base64-encoded, so no line of the message exceeds 76 characters.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

use courier_common::types::OutboundEmail;

use super::{Transport, TransportError};

/// Longest reply line accepted from the relay.
const MAX_REPLY_LINE: usize = 4096;

/// Encoded body line length (RFC 2045).
const BASE64_LINE: usize = 76;

/// When to upgrade the session with `STARTTLS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SmtpTls {
    /// Never upgrade
    Disabled,
    /// Upgrade whenever the relay advertises `STARTTLS`
    #[default]
    Opportunistic,
    /// Give up on relays that do not advertise `STARTTLS`
    Required,
}

impl FromStr for SmtpTls {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "opportunistic" => Ok(Self::Opportunistic),
            "required" => Ok(Self::Required),
            other => Err(format!("unknown SMTP TLS mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    /// `(username, password)` for `AUTH PLAIN`; no authentication when absent
    pub credentials: Option<(String, String)>,
    /// Name announced in `EHLO` and used as the Message-ID domain
    pub helo_name: String,
    /// Upper bound on one full session
    pub timeout: Duration,
    pub tls: SmtpTls,
    /// Send credentials even when the session is not encrypted
    pub allow_insecure_auth: bool,
}

pub struct SmtpTransport {
    config: SmtpConfig,
    tls: TlsConnector,
}

impl SmtpTransport {
    /// Transport that verifies relay certificates against the system roots.
    pub fn new(config: SmtpConfig) -> Result<Self, TransportError> {
        Self::with_roots(config, system_roots())
    }

    pub fn with_roots(config: SmtpConfig, roots: RootCertStore) -> Result<Self, TransportError> {
        let client = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Self {
            config,
            tls: TlsConnector::from(Arc::new(client)),
        })
    }

    async fn session(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        for address in [&email.from, &email.to] {
            if address.contains(['\r', '\n', '<', '>']) {
                return Err(TransportError::Protocol(format!(
                    "address {address:?} cannot be used in an SMTP envelope"
                )));
            }
        }

        let stream = TcpStream::connect((self.config.host.as_str(), self.config.port)).await?;
        let mut conn = Connection::new(stream);
        conn.expect_reply("greeting", 220).await?;
        let capabilities = conn.ehlo(&self.config.helo_name).await?;

        let upgrade = match self.config.tls {
            SmtpTls::Disabled => false,
            SmtpTls::Opportunistic => advertises(&capabilities, "STARTTLS"),
            SmtpTls::Required if advertises(&capabilities, "STARTTLS") => true,
            SmtpTls::Required => {
                return Err(TransportError::Tls(format!(
                    "{} does not offer STARTTLS",
                    self.config.host
                )));
            }
        };
        if !upgrade {
            return self.transact(&mut conn, email, false).await;
        }

        conn.command("STARTTLS", "STARTTLS", 220).await?;
        let server_name = ServerName::try_from(self.config.host.clone()).map_err(|e| {
            TransportError::Tls(format!("invalid relay name {}: {e}", self.config.host))
        })?;
        let stream = self
            .tls
            .connect(server_name, conn.into_inner()?)
            .await
            .map_err(|e| TransportError::Tls(format!("handshake failed: {e}")))?;

        // Capabilities from before the handshake no longer count
        let mut conn = Connection::new(stream);
        conn.ehlo(&self.config.helo_name).await?;
        self.transact(&mut conn, email, true).await
    }

    async fn transact<S>(
        &self,
        conn: &mut Connection<S>,
        email: &OutboundEmail,
        encrypted: bool,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some((user, pass)) = &self.config.credentials {
            if !encrypted && !self.config.allow_insecure_auth {
                return Err(TransportError::Tls(
                    "refusing to authenticate over an unencrypted connection".to_string(),
                ));
            }
            let token = BASE64.encode(format!("\0{user}\0{pass}"));
            conn.command("AUTH", &format!("AUTH PLAIN {token}"), 235)
                .await?;
        }

        conn.command("MAIL FROM", &format!("MAIL FROM:<{}>", email.from), 250)
            .await?;
        conn.command("RCPT TO", &format!("RCPT TO:<{}>", email.to), 250)
            .await?;
        conn.command("DATA", "DATA", 354).await?;

        let message = render_message(email, &self.config.helo_name);
        conn.write(dot_stuff(&message).as_bytes()).await?;
        conn.write(b".\r\n").await?;
        conn.expect_reply("message", 250).await?;

        // The message is accepted at this point; a failed QUIT changes nothing.
        if let Err(err) = conn.command("QUIT", "QUIT", 221).await {
            tracing::debug!(request_id = %email.request_id, error = %err, "SMTP QUIT failed");
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<(), TransportError> {
        match tokio::time::timeout(self.config.timeout, self.session(email)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.config.timeout)),
        }
    }
}

fn system_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        tracing::warn!(errors = ?native.errors, "Some system certificates could not be loaded");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "Loaded system root certificates");
    roots
}

/// Whether an `EHLO` reply lists `keyword`. The first line is the relay's greeting.
fn advertises(ehlo: &str, keyword: &str) -> bool {
    ehlo.lines().skip(1).any(|line| {
        line.split_whitespace()
            .next()
            .is_some_and(|word| word.eq_ignore_ascii_case(keyword))
    })
}

struct Connection<S> {
    stream: BufReader<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    /// Give the raw stream back for the TLS handshake.
    fn into_inner(self) -> Result<S, TransportError> {
        // Bytes read ahead of the handshake were never protected
        if !self.stream.buffer().is_empty() {
            return Err(TransportError::Protocol(
                "relay sent data before the TLS handshake".to_string(),
            ));
        }
        Ok(self.stream.into_inner())
    }

    async fn ehlo(&mut self, name: &str) -> Result<String, TransportError> {
        self.command("EHLO", &format!("EHLO {name}"), 250).await
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let stream = self.stream.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn command(
        &mut self,
        stage: &'static str,
        line: &str,
        expected: u16,
    ) -> Result<String, TransportError> {
        self.write(format!("{line}\r\n").as_bytes()).await?;
        self.expect_reply(stage, expected).await
    }

    async fn expect_reply(&mut self, stage: &'static str, expected: u16) -> Result<String, TransportError> {
        let (code, message) = self.read_reply().await?;
        if code != expected {
            return Err(TransportError::Smtp {
                stage,
                code,
                message,
            });
        }
        Ok(message)
    }

    /// Read one possibly multi-line reply (`250-a`, `250-b`, `250 c`).
    async fn read_reply(&mut self) -> Result<(u16, String), TransportError> {
        let mut lines = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await?;
            if n == 0 {
                return Err(TransportError::Protocol(
                    "connection closed by relay".to_string(),
                ));
            }
            if line.len() > MAX_REPLY_LINE {
                return Err(TransportError::Protocol("reply line too long".to_string()));
            }

            let line = line.trim_end_matches(['\r', '\n']);
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| TransportError::Protocol(format!("malformed reply: {line:?}")))?;
            let separator = line.as_bytes().get(3).copied();
            lines.push(line.get(4..).unwrap_or_default().to_string());

            match separator {
                Some(b'-') => continue,
                None | Some(b' ') => return Ok((code, lines.join("\n"))),
                Some(_) => {
                    return Err(TransportError::Protocol(format!("malformed reply: {line:?}")));
                }
            }
        }
    }
}

/// Render headers and body with CRLF line endings, ending in CRLF.
fn render_message(email: &OutboundEmail, domain: &str) -> String {
    let mut out = String::new();
    push_header(&mut out, "From", &email.from);
    push_header(&mut out, "To", &email.to);
    push_header(&mut out, "Subject", &encode_header(&email.subject));
    push_header(&mut out, "Date", &chrono::Utc::now().to_rfc2822());
    push_header(
        &mut out,
        "Message-ID",
        &format!("<{}@{domain}>", uuid::Uuid::new_v4()),
    );
    push_header(&mut out, "MIME-Version", "1.0");

    match (&email.text, &email.html) {
        (Some(text), Some(html)) => {
            let boundary = format!("courier-{}", uuid::Uuid::new_v4().simple());
            push_header(
                &mut out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{boundary}\""),
            );
            out.push_str("\r\n");
            push_part(&mut out, &boundary, "text/plain", text);
            push_part(&mut out, &boundary, "text/html", html);
            out.push_str(&format!("--{boundary}--\r\n"));
        }
        (Some(body), None) => push_single(&mut out, "text/plain", body),
        (None, Some(body)) => push_single(&mut out, "text/html", body),
        (None, None) => push_single(&mut out, "text/plain", ""),
    }
    out
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    // Strip CR/LF so a value can never start a new header
    out.extend(value.chars().filter(|c| *c != '\r' && *c != '\n'));
    out.push_str("\r\n");
}

fn push_single(out: &mut String, content_type: &str, body: &str) {
    push_header(
        out,
        "Content-Type",
        &format!("{content_type}; charset=utf-8"),
    );
    push_header(out, "Content-Transfer-Encoding", "base64");
    out.push_str("\r\n");
    push_body(out, body);
}

fn push_part(out: &mut String, boundary: &str, content_type: &str, body: &str) {
    out.push_str(&format!("--{boundary}\r\n"));
    push_single(out, content_type, body);
}

/// Base64 of the body in canonical CRLF form, wrapped at 76 characters.
fn push_body(out: &mut String, body: &str) {
    let canonical: String = body.lines().flat_map(|line| [line, "\r\n"]).collect();
    let encoded = BASE64.encode(canonical);
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + BASE64_LINE).min(encoded.len());
        // Base64 output is ASCII, so any byte offset is a char boundary
        out.push_str(&encoded[start..end]);
        out.push_str("\r\n");
        start = end;
    }
}

/// RFC 2047 encoded-word for non-ASCII header values.
fn encode_header(value: &str) -> String {
    if value.is_ascii() {
        value.to_string()
    } else {
        format!("=?UTF-8?B?{}?=", BASE64.encode(value))
    }
}

/// Escape lines beginning with `.` so they cannot end `DATA` early.
fn dot_stuff(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for line in message.split_inclusive("\r\n") {
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    out
}
