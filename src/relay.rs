/* src/relay.rs */

use crate::storage::{KeyValueStore, StorageError};
use fancy_log::{LogLevel, log};
use parking_lot::RwLock;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

pub const RELAY_SESSIONS_KEY: &str = "relay_sessions";

/// Oldest registrations are dropped past this many.
const MAX_RELAY_SESSIONS: usize = 32;

/// Identification sent to every collector.
const CLIENT_USER_AGENT: &str = "Interactsh-Client";

static HOST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.-]*$").expect("valid host regex"));

static SECRET_PARAM_RE: LazyLock<fancy_regex::Regex> = LazyLock::new(|| {
    fancy_regex::Regex::new(r"(?<=[?&]id=)[^&\s]+|(?<=correlation_id=)[^&\s]+")
        .expect("valid secret regex")
});

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("invalid collector host '{0}'")]
    InvalidHost(String),

    #[error("{0}")]
    Upstream(String),
}

/// Where a registered token lives upstream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpstreamSession {
    pub base_url: String,
    pub correlation_id: String,
    /// The callback domain the collector handed out.
    #[serde(default)]
    pub domain: String,
    /// Registration order, used for eviction.
    #[serde(default)]
    pub sequence: u64,
}

/// Builds the collector base URL, leaving out the scheme's default port.
pub fn upstream_base(server: &str, port: u16, tls: bool) -> Result<String, RelayError> {
    let server = server.trim();
    if !HOST_RE.is_match(server) {
        return Err(RelayError::InvalidHost(server.to_string()));
    }
    let scheme = if tls { "https" } else { "http" };
    let default_port = if tls { 443 } else { 80 };
    if port == default_port || port == 0 {
        Ok(format!("{}://{}", scheme, server))
    } else {
        Ok(format!("{}://{}:{}", scheme, server, port))
    }
}

fn sanitize_url_for_log(url: &str) -> String {
    SECRET_PARAM_RE.replace_all(url, "***").to_string()
}

/// Forwards register/poll/deregister calls to collector hosts and remembers
/// which host each token was registered with.
pub struct Relay {
    http: reqwest::Client,
    sessions: RwLock<HashMap<String, UpstreamSession>>,
    store: Arc<dyn KeyValueStore>,
    max_sessions: usize,
    persist_lock: Mutex<()>,
}

impl Relay {
    pub fn new(store: Arc<dyn KeyValueStore>, timeout: Duration) -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(CLIENT_USER_AGENT));

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::Upstream(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            sessions: RwLock::new(HashMap::new()),
            store,
            max_sessions: MAX_RELAY_SESSIONS,
            persist_lock: Mutex::new(()),
        })
    }

    /// Reloads the routing table. A broken table starts empty.
    pub async fn restore(&self) -> usize {
        let table = match self.store.get(RELAY_SESSIONS_KEY).await {
            Ok(Some(raw)) => serde_json::from_str::<HashMap<String, UpstreamSession>>(&raw)
                .unwrap_or_else(|e| {
                    log(
                        LogLevel::Warn,
                        &format!("Discarding unreadable relay sessions: {}", e),
                    );
                    HashMap::new()
                }),
            Ok(None) => HashMap::new(),
            Err(e) => {
                log(
                    LogLevel::Warn,
                    &format!("Failed to read relay sessions: {}", e),
                );
                HashMap::new()
            }
        };
        let count = table.len();
        *self.sessions.write() = table;
        count
    }

    pub fn lookup(&self, token: &str) -> Option<UpstreamSession> {
        self.sessions.read().get(token).cloned()
    }

    async fn forward(&self, request: reqwest::RequestBuilder) -> Result<Value, RelayError> {
        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Upstream(e.to_string()))?
            .error_for_status()
            .map_err(|e| RelayError::Upstream(e.to_string()))?;
        response
            .json::<Value>()
            .await
            .map_err(|e| RelayError::Upstream(format!("invalid upstream body: {}", e)))
    }

    /// Registers with `server` and returns the collector's body untouched.
    pub async fn register(&self, server: &str, port: u16, tls: bool) -> Result<Value, RelayError> {
        let base_url = upstream_base(server, port, tls)?;
        let url = format!("{}/register", base_url);
        log(LogLevel::Debug, &format!("Relaying register to {}", url));

        let body = self.forward(self.http.post(&url).json(&json!({}))).await?;

        let succeeded = body.get("success").and_then(Value::as_bool) == Some(true);
        let token = body.get("id").and_then(Value::as_str);
        if let (true, Some(token)) = (succeeded, token) {
            let correlation_id = body
                .get("correlation_id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let domain = body
                .get("domain")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            self.record(
                token.to_string(),
                UpstreamSession {
                    base_url,
                    correlation_id,
                    domain,
                    sequence: 0,
                },
            )
            .await;
        }
        Ok(body)
    }

    /// Polls the collector that issued `token`. `Ok(None)` means the token
    /// is unknown here.
    pub async fn poll(&self, token: &str) -> Result<Option<Value>, RelayError> {
        let Some(upstream) = self.lookup(token) else {
            return Ok(None);
        };
        let url = format!("{}/poll", upstream.base_url);
        let request = self.http.get(&url).query(&[
            ("id", token),
            ("correlation_id", upstream.correlation_id.as_str()),
        ]);
        if let Some(built) = request.try_clone().and_then(|r| r.build().ok()) {
            log(
                LogLevel::Debug,
                &format!("Relaying poll to {}", sanitize_url_for_log(built.url().as_str())),
            );
        }
        self.forward(request).await.map(Some)
    }

    /// Deregisters `token` upstream. The token is forgotten here even when
    /// the collector refuses, since it already counts as released.
    pub async fn deregister(&self, token: &str) -> Result<Option<Value>, RelayError> {
        let Some(upstream) = self.lookup(token) else {
            return Ok(None);
        };
        let url = format!("{}/deregister", upstream.base_url);
        let body = json!({
            "correlation-id": upstream.correlation_id,
            "secret-key": token,
        });
        let result = self.forward(self.http.post(&url).json(&body)).await;
        self.forget(token).await;
        result.map(Some)
    }

    async fn record(&self, token: String, mut upstream: UpstreamSession) {
        let _guard = self.persist_lock.lock().await;
        {
            let mut sessions = self.sessions.write();
            upstream.sequence = sessions
                .values()
                .map(|s| s.sequence + 1)
                .max()
                .unwrap_or(0);
            sessions.insert(token, upstream);
            while sessions.len() > self.max_sessions {
                let Some(oldest) = sessions
                    .iter()
                    .min_by_key(|(_, s)| s.sequence)
                    .map(|(t, _)| t.clone())
                else {
                    break;
                };
                sessions.remove(&oldest);
                log(LogLevel::Debug, "Evicted the oldest relay session.");
            }
        }
        self.persist().await;
    }

    async fn forget(&self, token: &str) {
        let _guard = self.persist_lock.lock().await;
        self.sessions.write().remove(token);
        self.persist().await;
    }

    async fn persist(&self) {
        let snapshot = self.sessions.read().clone();
        let result = if snapshot.is_empty() {
            self.store.remove(RELAY_SESSIONS_KEY).await
        } else {
            match serde_json::to_string(&snapshot) {
                Ok(json) => self.store.set(RELAY_SESSIONS_KEY, &json).await,
                Err(e) => Err(StorageError::from(e)),
            }
        };
        if let Err(e) = result {
            log(
                LogLevel::Error,
                &format!("Failed to persist relay sessions: {}", e),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn relay(store: Arc<MemoryStore>) -> Relay {
        Relay::new(store, Duration::from_secs(5)).unwrap()
    }

    fn port_of(server: &MockServer) -> u16 {
        server.address().port()
    }

    #[test]
    fn upstream_base_omits_default_ports() {
        assert_eq!(upstream_base("oast.fun", 443, true).unwrap(), "https://oast.fun");
        assert_eq!(
            upstream_base("127.0.0.1", 8080, false).unwrap(),
            "http://127.0.0.1:8080"
        );
        assert!(matches!(
            upstream_base("evil.com/path?x=", 443, true),
            Err(RelayError::InvalidHost(_))
        ));
        assert!(upstream_base("user@host", 443, true).is_err());
    }

    #[test]
    fn secrets_are_masked_in_logged_urls() {
        let masked = sanitize_url_for_log("https://oast.fun/poll?id=tok123&correlation_id=cid456");
        assert_eq!(masked, "https://oast.fun/poll?id=***&correlation_id=***");
    }

    #[tokio::test]
    async fn register_records_routing_and_poll_uses_it() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(header("user-agent", CLIENT_USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "id": "tok",
                "correlation_id": "cid",
                "domain": "cidxyz.collector"
            })))
            .mount(&collector)
            .await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .and(query_param("id", "tok"))
            .and(query_param("correlation_id", "cid"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "success": true, "data": [] })),
            )
            .expect(1)
            .mount(&collector)
            .await;

        let store = Arc::new(MemoryStore::new());
        let relay = relay(store.clone());
        let body = relay
            .register("127.0.0.1", port_of(&collector), false)
            .await
            .unwrap();
        assert_eq!(body["domain"], "cidxyz.collector");

        let polled = relay.poll("tok").await.unwrap().unwrap();
        assert_eq!(polled, json!({ "success": true, "data": [] }));
        assert_eq!(relay.poll("unknown").await.unwrap(), None);

        let reloaded = Relay::new(store, Duration::from_secs(5)).unwrap();
        assert_eq!(reloaded.restore().await, 1);
        let upstream = reloaded.lookup("tok").unwrap();
        assert_eq!(upstream.correlation_id, "cid");
        assert_eq!(upstream.domain, "cidxyz.collector");
    }

    #[tokio::test]
    async fn failed_registration_is_not_recorded() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&collector)
            .await;

        let relay = relay(Arc::new(MemoryStore::new()));
        let result = relay.register("127.0.0.1", port_of(&collector), false).await;

        assert!(matches!(result, Err(RelayError::Upstream(_))));
        assert_eq!(relay.restore().await, 0);
    }

    async fn mount_registrations(collector: &MockServer, tokens: &[&str]) {
        for token in tokens {
            Mock::given(method("POST"))
                .and(path("/register"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "success": true,
                    "id": token,
                    "correlation_id": format!("cid-{}", token),
                    "domain": format!("{}.collector", token)
                })))
                .up_to_n_times(1)
                .mount(collector)
                .await;
        }
    }

    #[tokio::test]
    async fn routing_table_drops_the_oldest_past_its_cap() {
        let collector = MockServer::start().await;
        mount_registrations(&collector, &["t1", "t2", "t3"]).await;

        let store = Arc::new(MemoryStore::new());
        let mut relay = relay(store.clone());
        relay.max_sessions = 2;
        for _ in 0..3 {
            relay
                .register("127.0.0.1", port_of(&collector), false)
                .await
                .unwrap();
        }

        assert_eq!(relay.lookup("t1"), None);
        assert!(relay.lookup("t2").is_some());
        assert!(relay.lookup("t3").is_some());
        let reloaded = Relay::new(store, Duration::from_secs(5)).unwrap();
        assert_eq!(reloaded.restore().await, 2);
    }

    #[tokio::test]
    async fn refused_deregister_still_forgets_the_token() {
        let collector = MockServer::start().await;
        mount_registrations(&collector, &["tok"]).await;
        Mock::given(method("POST"))
            .and(path("/deregister"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&collector)
            .await;

        let store = Arc::new(MemoryStore::new());
        let relay = relay(store.clone());
        relay
            .register("127.0.0.1", port_of(&collector), false)
            .await
            .unwrap();

        assert!(matches!(
            relay.deregister("tok").await,
            Err(RelayError::Upstream(_))
        ));
        assert_eq!(relay.lookup("tok"), None);
        assert_eq!(store.get(RELAY_SESSIONS_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn deregister_forgets_the_token() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "id": "tok",
                "correlation_id": "cid",
                "domain": "cidxyz.collector"
            })))
            .mount(&collector)
            .await;
        Mock::given(method("POST"))
            .and(path("/deregister"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&collector)
            .await;

        let relay = relay(Arc::new(MemoryStore::new()));
        relay
            .register("127.0.0.1", port_of(&collector), false)
            .await
            .unwrap();

        assert!(relay.deregister("tok").await.unwrap().is_some());
        assert_eq!(relay.lookup("tok"), None);
        assert_eq!(relay.deregister("tok").await.unwrap(), None);
    }
}
