/* src/handlers.rs */

use crate::{
    failover::FailoverState,
    relay::RelayError,
    response,
    state::AppState,
};
use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use fancy_log::{LogLevel, log};
use serde::Deserialize;
use serde_json::json;

// --- Relay Endpoints ---

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub server: Option<String>,
    pub port: Option<u16>,
    pub scheme: Option<bool>,
}

/// POST /api/register - Registers with a collector and returns its body.
pub async fn relay_register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Response {
    let server = payload
        .server
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| state.collector.preferred_host());
    let port = payload.port.unwrap_or(state.collector.port);
    let tls = payload.scheme.unwrap_or(state.collector.tls);

    match state.relay.register(&server, port, tls).await {
        Ok(body) => response::relay(StatusCode::OK, body),
        Err(RelayError::InvalidHost(host)) => response::relay(
            StatusCode::BAD_REQUEST,
            json!({ "success": false, "error": format!("Invalid server '{}'", host) }),
        ),
        Err(e) => {
            log(
                LogLevel::Error,
                &format!("Error registering with '{}': {}", server, e),
            );
            response::relay_failure("Failed to register with collector server", e)
        }
    }
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub id: Option<String>,
}

fn invalid_token() -> Response {
    response::relay(
        StatusCode::BAD_REQUEST,
        json!({ "success": false, "error": "Invalid or missing token" }),
    )
}

/// GET /api/poll?id={token} - Polls the collector that issued the token.
pub async fn relay_poll(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(token) = query.id.filter(|t| !t.is_empty()) else {
        return invalid_token();
    };
    match state.relay.poll(&token).await {
        Ok(Some(body)) => response::relay(StatusCode::OK, body),
        Ok(None) => invalid_token(),
        Err(e) => {
            log(
                LogLevel::Warn,
                &format!("Error polling collector: {}", e),
            );
            response::relay_failure("Failed to poll collector server", e)
        }
    }
}

/// GET /api/domain?id={token} - The domain registered under a token.
pub async fn relay_domain(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let Some(upstream) = query
        .id
        .filter(|t| !t.is_empty())
        .and_then(|t| state.relay.lookup(&t))
    else {
        return invalid_token();
    };
    response::relay(
        StatusCode::OK,
        json!({ "success": true, "domain": upstream.domain }),
    )
}

#[derive(Deserialize)]
pub struct DeregisterRequest {
    pub id: Option<String>,
}

/// POST /api/deregister - Releases a session upstream.
pub async fn relay_deregister(
    State(state): State<AppState>,
    Json(payload): Json<DeregisterRequest>,
) -> Response {
    let Some(token) = payload.id.filter(|t| !t.is_empty()) else {
        return invalid_token();
    };
    match state.relay.deregister(&token).await {
        Ok(Some(body)) => response::relay(StatusCode::OK, body),
        Ok(None) => invalid_token(),
        Err(e) => response::relay_failure("Failed to deregister from collector server", e),
    }
}

// --- Control Endpoints ---

fn failover_label(state: &FailoverState) -> String {
    match state {
        FailoverState::Idle => "idle".to_string(),
        FailoverState::Attempting(host) => format!("attempting {}", host),
        FailoverState::Succeeded(_) => "succeeded".to_string(),
        FailoverState::Exhausted => "exhausted".to_string(),
    }
}

/// GET /v1/session - Current domain and polling status.
pub async fn get_session(State(state): State<AppState>) -> Response {
    let identity = state.session.current();
    response::success(Some(json!({
        "domain": identity.as_ref().map(|i| i.domain.clone()),
        "correlation_id": identity.as_ref().map(|i| i.correlation_id.clone()),
        "polling": state.scheduler.is_polling(),
        "server": state.failover.active_host(),
        "failover": failover_label(&state.failover.state()),
        "log_entries": state.events.len(),
    })))
}

/// POST /v1/session - Starts generating a new domain in the background.
pub async fn create_session(State(state): State<AppState>) -> Response {
    if let FailoverState::Attempting(host) = state.failover.state() {
        return response::error(
            StatusCode::CONFLICT,
            format!("Domain generation is already in progress (trying {}).", host),
        );
    }
    tokio::spawn(async move {
        state.generate_new_domain().await;
    });
    response::accepted("Domain generation started.")
}

/// POST /v1/polling - Toggles polling.
pub async fn toggle_polling(State(state): State<AppState>) -> Response {
    let polling = state.toggle_polling().await;
    response::success(Some(json!({ "polling": polling })))
}

/// GET /v1/logs - Plain-text export, newest first.
pub async fn export_logs(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.events.export(),
    )
        .into_response()
}

/// DELETE /v1/logs - Clears the log.
pub async fn clear_logs(State(state): State<AppState>) -> Response {
    state.events.clear().await;
    state.observer.on_notify("Logs cleared", false);
    response::success(None)
}
