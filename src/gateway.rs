/* src/gateway.rs */

use async_trait::async_trait;
use chrono::DateTime;
use fancy_log::{LogLevel, log};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// --- Wire Types ---

/// The identity handed out by a collector: the callback domain plus the
/// secrets needed to poll it. Replaced wholesale, never edited.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionIdentity {
    pub domain: String,
    pub correlation_id: String,
    pub token: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Protocol {
    Dns,
    Http,
    Smtp,
    Other(String),
}

impl Protocol {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "DNS" => Protocol::Dns,
            "HTTP" => Protocol::Http,
            "SMTP" => Protocol::Smtp,
            other => Protocol::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Dns => f.write_str("DNS"),
            Protocol::Http => f.write_str("HTTP"),
            Protocol::Smtp => f.write_str("SMTP"),
            Protocol::Other(name) => f.write_str(name),
        }
    }
}

/// One inbound probe reported by the collector.
#[derive(Clone, Debug, PartialEq)]
pub struct InteractionRecord {
    /// Seconds since the Unix epoch. `None` when the collector sent none or
    /// sent something unreadable.
    pub timestamp: Option<i64>,
    pub protocol: Protocol,
    pub remote_address: Option<String>,
    /// The full upstream object, kept for display.
    pub raw: Value,
}

impl InteractionRecord {
    /// Reads one element of a poll batch. Only a non-object is rejected;
    /// missing fields fall back to placeholders so the record still shows.
    pub fn from_value(raw: Value) -> Result<Self, GatewayError> {
        if !raw.is_object() {
            return Err(GatewayError::InvalidResponse(format!(
                "interaction is not an object: {}",
                raw
            )));
        }

        let protocol = raw
            .get("protocol")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(Protocol::parse)
            .unwrap_or_else(|| Protocol::Other("UNKNOWN".into()));

        let timestamp = match raw.get("timestamp") {
            Some(Value::Number(n)) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.timestamp())
                .ok(),
            _ => None,
        };

        let remote_address = raw
            .get("remote_address")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);

        Ok(Self {
            timestamp,
            protocol,
            remote_address,
            raw,
        })
    }
}

// --- Errors ---

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    /// The relay could not be reached.
    #[error("network error: {0}")]
    Network(String),

    /// The body was malformed or missing required fields.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// The relay or the collector behind it reported a failure.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
}

// --- Gateway Contract ---

#[async_trait]
pub trait Gateway: Send + Sync {
    /// Asks the relay to register a new session with `host`.
    async fn register(&self, host: &str) -> Result<SessionIdentity, GatewayError>;

    /// Fetches interactions recorded since the last poll. An empty token
    /// never reaches the network.
    async fn poll(&self, token: &str) -> Result<Vec<InteractionRecord>, GatewayError>;

    /// Releases a session that is no longer in use.
    async fn deregister(&self, token: &str) -> Result<(), GatewayError>;
}

#[derive(Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    success: bool,
    id: Option<String>,
    correlation_id: Option<String>,
    domain: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct PollResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Vec<Value>>,
    error: Option<String>,
}

/// Talks to the relay's `/api/register` and `/api/poll` endpoints.
pub struct RelayClient {
    http: reqwest::Client,
    relay_base: String,
    port: u16,
    tls: bool,
}

impl RelayClient {
    pub fn new(
        relay_base: &str,
        port: u16,
        tls: bool,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("lazy-oast/", env!("CARGO_PKG_VERSION"))),
        );

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| GatewayError::Network(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            relay_base: relay_base.trim_end_matches('/').to_string(),
            port,
            tls,
        })
    }

    /// Sends the request and returns the body of a 2xx response.
    async fn fetch(&self, request: reqwest::RequestBuilder) -> Result<String, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GatewayError::Network(format!("failed to read body: {}", e)))?;

        if !status.is_success() {
            return Err(GatewayError::Server {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(body)
    }
}

/// Pulls the most specific failure text out of a relay error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("details")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

#[async_trait]
impl Gateway for RelayClient {
    async fn register(&self, host: &str) -> Result<SessionIdentity, GatewayError> {
        let url = format!("{}/api/register", self.relay_base);
        let body = json!({ "server": host, "port": self.port, "scheme": self.tls });

        let text = self.fetch(self.http.post(&url).json(&body)).await?;
        let parsed: RegisterResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if !parsed.success {
            return Err(match parsed.error {
                Some(message) => GatewayError::Server {
                    status: 200,
                    message,
                },
                None => GatewayError::InvalidResponse("missing success flag".into()),
            });
        }

        match (parsed.id, parsed.correlation_id, parsed.domain) {
            (Some(token), Some(correlation_id), Some(domain))
                if !token.is_empty() && !correlation_id.is_empty() && !domain.is_empty() =>
            {
                Ok(SessionIdentity {
                    domain,
                    correlation_id,
                    token,
                })
            }
            _ => Err(GatewayError::InvalidResponse(
                "registration body lacks id, correlation_id or domain".into(),
            )),
        }
    }

    async fn poll(&self, token: &str) -> Result<Vec<InteractionRecord>, GatewayError> {
        if token.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/poll", self.relay_base);
        let text = self
            .fetch(self.http.get(&url).query(&[("id", token)]))
            .await?;
        let parsed: PollResponse = serde_json::from_str(&text)
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;

        if !parsed.success {
            return Err(GatewayError::Server {
                status: 200,
                message: parsed.error.unwrap_or_else(|| "poll was unsuccessful".into()),
            });
        }

        // The upstream poll drains its queue, so one bad element must not
        // cost the rest of the batch.
        let records = parsed
            .data
            .unwrap_or_default()
            .into_iter()
            .filter_map(|raw| match InteractionRecord::from_value(raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    log(LogLevel::Warn, &format!("Skipping interaction: {}", e));
                    None
                }
            })
            .collect();
        Ok(records)
    }

    async fn deregister(&self, token: &str) -> Result<(), GatewayError> {
        if token.is_empty() {
            return Ok(());
        }

        let url = format!("{}/api/deregister", self.relay_base);
        self.fetch(self.http.post(&url).json(&json!({ "id": token })))
            .await?;
        Ok(())
    }
}
