/* src/response.rs */

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::ACCESS_CONTROL_ALLOW_ORIGIN},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

/// `{"status": "Success", "data": ...}`
pub fn success(data: Option<Value>) -> Response {
    let body = match data {
        Some(data) => json!({ "status": "Success", "data": data }),
        None => json!({ "status": "Success" }),
    };
    (StatusCode::OK, Json(body)).into_response()
}

pub fn accepted(message: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "Accepted", "message": message })),
    )
        .into_response()
}

pub fn error(status: StatusCode, message: impl Into<String>) -> Response {
    let message: String = message.into();
    (status, Json(json!({ "status": "Error", "message": message }))).into_response()
}

/// Relay bodies go back unwrapped and readable from any origin.
pub fn relay(status: StatusCode, body: Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

pub fn relay_failure(error: &str, details: impl std::fmt::Display) -> Response {
    relay(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({ "error": error, "details": details.to_string() }),
    )
}
