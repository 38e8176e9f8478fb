//! Token authentication for the relay surface.
//!
//! Resolves the caller from the in-memory snapshot, assigns the opaque
//! request id, and stashes both as request extensions for the handlers.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use tollgate_adapter::{ErrorKind, RelayError, RelayFormat};
use tollgate_relay::AppState;

use crate::render::error_response;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Bearer token, with the per-dialect fallbacks: `x-api-key` (Claude),
/// `x-goog-api-key` or `?key=` (Gemini), `mj-api-secret` (Midjourney-proxy).
fn extract_api_key(headers: &HeaderMap, query: Option<&str>) -> Option<String> {
    if let Some(value) = headers
        .get("authorization")
        .and_then(|value| value.to_str().ok())
    {
        let token = value.strip_prefix("Bearer ").unwrap_or(value);
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }
    for name in ["x-api-key", "x-goog-api-key", "mj-api-secret"] {
        if let Some(value) = headers.get(name).and_then(|value| value.to_str().ok()) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    query.and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("key=")
                .filter(|key| !key.is_empty())
                .map(str::to_string)
        })
    })
}

fn dialect_of(path: &str) -> RelayFormat {
    if path.starts_with("/v1/messages") {
        RelayFormat::Claude
    } else if path.starts_with("/v1beta/") {
        RelayFormat::Gemini
    } else if path.starts_with("/v1/realtime") {
        RelayFormat::OpenAIRealtime
    } else if path.starts_with("/mj/") {
        RelayFormat::MjProxy
    } else if path.starts_with("/suno/") || path.starts_with("/video/") {
        RelayFormat::Task
    } else {
        RelayFormat::OpenAI
    }
}

pub async fn relay_auth(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);

    let Some(api_key) = extract_api_key(request.headers(), query.as_deref()) else {
        let err = RelayError::new(ErrorKind::InvalidRequest, "no credentials provided")
            .with_status(401);
        return error_response(dialect_of(&path), &request_id, &err);
    };
    let Some(auth) = state.authenticate_token(&api_key) else {
        let err = RelayError::new(ErrorKind::InvalidRequest, "invalid or disabled token")
            .with_status(401);
        return error_response(dialect_of(&path), &request_id, &err);
    };

    request.extensions_mut().insert(RequestId(request_id));
    request.extensions_mut().insert(auth);
    next.run(request).await
}
