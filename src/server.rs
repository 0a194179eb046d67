/* src/server.rs */

use crate::{handlers, state::AppState};
use axum::{
    Router,
    routing::{get, post},
};
use fancy_log::{LogLevel, log};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::signal;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/register", post(handlers::relay_register))
        .route("/api/poll", get(handlers::relay_poll))
        .route("/api/deregister", post(handlers::relay_deregister))
        .route("/api/domain", get(handlers::relay_domain))
        .route(
            "/v1/session",
            get(handlers::get_session).post(handlers::create_session),
        )
        .route("/v1/polling", post(handlers::toggle_polling))
        .route(
            "/v1/logs",
            get(handlers::export_logs).delete(handlers::clear_logs),
        )
        .with_state(state)
}

/// Binds the listener up front so the built-in relay is reachable before
/// the first registration goes out.
pub async fn bind(port: u16) -> Result<TcpListener, Box<dyn std::error::Error>> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(&addr).await?;
    log(
        LogLevel::Info,
        &format!("HTTP Server listening on: http://{}", listener.local_addr()?),
    );
    Ok(listener)
}

/// Serves the router until a shutdown signal arrives.
pub async fn run_server(
    listener: TcpListener,
    state: AppState,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state.clone());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.shutdown();
    Ok(())
}

/// Listens for shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log(
                LogLevel::Error,
                &format!("Failed to install Ctrl+C handler: {}", e),
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log(
                    LogLevel::Error,
                    &format!("Failed to install SIGTERM handler: {}", e),
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log(
        LogLevel::Warn,
        "Signal received, starting graceful shutdown...",
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, CollectorConfig};
    use crate::failover::FailoverState;
    use crate::gateway::{
        Gateway, GatewayError, InteractionRecord, Protocol, RelayClient, SessionIdentity,
    };
    use crate::observer::testing::RecordingObserver;
    use crate::storage::MemoryStore;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Starts the daemon's router on an ephemeral port with the given
    /// collector list, and a relay client pointed back at it. The data dir
    /// lives as long as the returned `TempDir`.
    async fn spawn_daemon(servers: Vec<String>, port: u16) -> (AppState, String, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let config = AppConfig {
            log_level: fancy_log::LogLevel::Info,
            dir_path: dir.path().to_path_buf(),
            bind_port: 0,
            relay_base: base.clone(),
            polling_interval: Duration::from_secs(60),
            max_logs: 100,
            retry_delay: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
        };
        let collector = CollectorConfig {
            preferred: servers.first().cloned(),
            servers,
            port,
            tls: false,
        };
        let state = AppState::new(
            config,
            collector,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingObserver::default()),
        )
        .unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (state, base, dir)
    }

    async fn mount_collector(collector: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "id": "tok",
                "correlation_id": "cid",
                "domain": "cidabcdefghijklmnopqrstuvwxyz.collector.test"
            })))
            .mount(collector)
            .await;
        Mock::given(method("GET"))
            .and(path("/poll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": [
                    { "protocol": "dns", "timestamp": 1700000000, "remote_address": "192.0.2.7" }
                ]
            })))
            .mount(collector)
            .await;
    }

    #[tokio::test]
    async fn register_and_poll_through_the_relay() {
        let collector = MockServer::start().await;
        mount_collector(&collector).await;
        let port = collector.address().port();
        // The relay rejects "bad_host", so registration has to fail over.
        let (state, _, _dir) =
            spawn_daemon(vec!["bad_host".into(), "127.0.0.1".into()], port).await;

        assert!(state.generate_new_domain().await);
        assert_eq!(state.failover.active_host(), "127.0.0.1");
        assert!(matches!(state.failover.state(), FailoverState::Succeeded(_)));

        state.scheduler.poll_once().await;
        state.shutdown();

        let export = state.events.export();
        assert!(export.contains("DNS from 192.0.2.7"));
        assert!(export.contains("New domain generated: cid"));
    }

    #[tokio::test]
    async fn new_domain_releases_the_previous_relay_session() {
        let collector = MockServer::start().await;
        for token in ["tok1", "tok2"] {
            Mock::given(method("POST"))
                .and(path("/register"))
                .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                    "success": true,
                    "id": token,
                    "correlation_id": "cid",
                    "domain": format!("cid{}.collector.test", token)
                })))
                .up_to_n_times(1)
                .mount(&collector)
                .await;
        }
        Mock::given(method("POST"))
            .and(path("/deregister"))
            .and(body_json(json!({ "correlation-id": "cid", "secret-key": "tok1" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&collector)
            .await;
        let port = collector.address().port();
        let (state, base, _dir) = spawn_daemon(vec!["127.0.0.1".into()], port).await;

        assert!(state.generate_new_domain().await);
        assert!(state.relay.lookup("tok1").is_some());
        assert!(state.generate_new_domain().await);
        state.shutdown();

        let http = reqwest::Client::new();
        let domain: Value = http
            .get(format!("{}/api/domain?id=tok2", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(domain, json!({ "success": true, "domain": "cidtok2.collector.test" }));
        let released = http
            .get(format!("{}/api/domain?id=tok1", base))
            .send()
            .await
            .unwrap();
        assert_eq!(released.status().as_u16(), 400);

        assert_eq!(state.session.current().unwrap().token, "tok2");
        assert_eq!(state.relay.lookup("tok1"), None);
        assert!(state.relay.lookup("tok2").is_some());
        assert_eq!(state.relay.restore().await, 1);
    }

    #[tokio::test]
    async fn relay_responses_allow_any_origin() {
        let collector = MockServer::start().await;
        mount_collector(&collector).await;
        let port = collector.address().port();
        let (_state, base, _dir) = spawn_daemon(vec!["127.0.0.1".into()], port).await;
        let http = reqwest::Client::new();

        let response = http
            .get(format!("{}/api/poll?id=nobody", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 400);
        assert_eq!(
            response.headers()["access-control-allow-origin"].to_str().unwrap(),
            "*"
        );
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Invalid or missing token");
    }

    #[tokio::test]
    async fn upstream_failure_becomes_structured_error() {
        let collector = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&collector)
            .await;
        let port = collector.address().port();
        let (state, base, _dir) = spawn_daemon(vec!["127.0.0.1".into()], port).await;

        let response = reqwest::Client::new()
            .post(format!("{}/api/register", base))
            .json(&json!({ "server": "127.0.0.1", "port": port, "scheme": false }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 500);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "Failed to register with collector server");
        assert!(body["details"].as_str().is_some());

        let client = RelayClient::new(&base, port, false, Duration::from_secs(5)).unwrap();
        assert!(matches!(
            client.register("127.0.0.1").await,
            Err(GatewayError::Server { status: 500, .. })
        ));
        assert_eq!(state.session.current(), None);
    }

    #[tokio::test]
    async fn control_api_reports_and_exports() {
        let collector = MockServer::start().await;
        mount_collector(&collector).await;
        let port = collector.address().port();
        let (state, base, _dir) = spawn_daemon(vec!["127.0.0.1".into()], port).await;
        state
            .events
            .append(&[InteractionRecord {
                timestamp: Some(1_700_000_000),
                protocol: Protocol::Smtp,
                remote_address: Some("198.51.100.1".into()),
                raw: json!({ "protocol": "smtp" }),
            }])
            .await;
        state
            .session
            .replace(SessionIdentity {
                domain: "abc.collector.test".into(),
                correlation_id: "abc".into(),
                token: "tok".into(),
            })
            .await;
        let http = reqwest::Client::new();

        let session: Value = http
            .get(format!("{}/v1/session", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(session["status"], "Success");
        assert_eq!(session["data"]["domain"], "abc.collector.test");
        assert_eq!(session["data"]["polling"], false);

        let text = http
            .get(format!("{}/v1/logs", base))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(text.contains("SMTP from 198.51.100.1"));

        let toggled: Value = http
            .post(format!("{}/v1/polling", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(toggled["data"]["polling"], true);
        state.shutdown();

        let cleared = http.delete(format!("{}/v1/logs", base)).send().await.unwrap();
        assert!(cleared.status().is_success());
        assert_eq!(state.events.len(), 0);
    }
}
