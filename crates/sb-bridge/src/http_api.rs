//! Axum surface over the [`CommandBus`].
//!
//! `POST /api/command` carries `{action, params, csrf_token}`. The session's
//! CSRF token is taken from the `X-Session-Csrf` header, which the session
//! layer in front of this service is trusted to set.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use sb_core::store::SettingsMap;
use sb_engine::ErrorKind;
use sb_harness::security::CsrfToken;
use sb_telemetry::tracing_setup::request_id_middleware;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, error};

use crate::command_bus::{CommandBus, CommandError, Envelope};

pub const SESSION_CSRF_HEADER: &str = "x-session-csrf";

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub action: String,
    #[serde(default)]
    pub params: SettingsMap,
    #[serde(default)]
    pub csrf_token: Option<String>,
}

#[derive(Clone)]
pub struct ApiState {
    pub bus: Arc<CommandBus>,
    /// Serve `GET /api/session/csrf` for local development setups that have
    /// no session layer of their own.
    pub mint_dev_tokens: bool,
}

impl ApiState {
    pub fn new(bus: Arc<CommandBus>) -> Self {
        Self {
            bus,
            mint_dev_tokens: false,
        }
    }

    pub fn with_dev_tokens(mut self, enabled: bool) -> Self {
        self.mint_dev_tokens = enabled;
        self
    }
}

fn status_for(envelope: &Envelope) -> StatusCode {
    match envelope.error_kind {
        None => StatusCode::OK,
        Some(ErrorKind::Client) => StatusCode::BAD_REQUEST,
        Some(ErrorKind::Provider) => StatusCode::BAD_GATEWAY,
        Some(ErrorKind::Configuration) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn post_command(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> impl IntoResponse {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            debug!(error = %rejection, "malformed command body");
            let envelope = Envelope::failure(&CommandError::InvalidParams(rejection.body_text()));
            return (status_for(&envelope), Json(envelope));
        }
    };
    let session = headers
        .get(SESSION_CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let supplied = req.csrf_token.as_deref().unwrap_or("");

    let envelope = state
        .bus
        .dispatch(&req.action, req.params, session, supplied)
        .await;
    (status_for(&envelope), Json(envelope))
}

async fn get_health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let envelope = state
        .bus
        .dispatch("get_health", SettingsMap::new(), "", "")
        .await;
    (status_for(&envelope), Json(envelope))
}

async fn get_dev_token(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    if !state.mint_dev_tokens {
        return (StatusCode::NOT_FOUND, Json(json!({"error": "not found"})));
    }
    match CsrfToken::generate() {
        Ok(token) => (
            StatusCode::OK,
            Json(json!({"csrf_token": token.as_str(), "issued_at": Utc::now()})),
        ),
        Err(e) => {
            error!(error = %e, "failed to mint csrf token");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "token generation failed"})),
            )
        }
    }
}

fn is_local_origin(origin: &HeaderValue) -> bool {
    origin.to_str().is_ok_and(|o| {
        ["http://localhost", "http://127.0.0.1", "https://localhost", "https://127.0.0.1"]
            .iter()
            .any(|prefix| o.starts_with(prefix))
    })
}

pub fn api_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/command", post(post_command))
        .route("/api/health", get(get_health))
        .route("/api/session/csrf", get(get_dev_token))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(
                    |origin: &HeaderValue, _parts: &axum::http::request::Parts| {
                        is_local_origin(origin)
                    },
                ))
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([
                    axum::http::header::CONTENT_TYPE,
                    axum::http::HeaderName::from_static(SESSION_CSRF_HEADER),
                ]),
        )
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_origins_only() {
        assert!(is_local_origin(&HeaderValue::from_static("http://localhost:5173")));
        assert!(is_local_origin(&HeaderValue::from_static("https://127.0.0.1")));
        assert!(!is_local_origin(&HeaderValue::from_static("https://evil.example")));
    }

    #[test]
    fn status_follows_error_kind() {
        let ok = Envelope::ok(json!(null));
        assert_eq!(status_for(&ok), StatusCode::OK);

        let mut failed = ok.clone();
        failed.success = false;
        failed.error_kind = Some(ErrorKind::Provider);
        assert_eq!(status_for(&failed), StatusCode::BAD_GATEWAY);
        failed.error_kind = Some(ErrorKind::Configuration);
        assert_eq!(status_for(&failed), StatusCode::SERVICE_UNAVAILABLE);
    }
}
