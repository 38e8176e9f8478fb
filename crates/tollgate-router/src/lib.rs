//! Inbound HTTP surface: one route per dialect endpoint, token auth in
//! front, and a fallback that either answers a JSON 404 or redirects to the
//! configured frontend.

pub mod auth;
pub mod handlers;
pub mod realtime;
pub mod render;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get, post};
use axum::Router;

use tollgate_relay::AppState;

pub fn relay_router(state: Arc<AppState>) -> Router {
    Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/completions", post(handlers::completions))
        .route("/v1/embeddings", post(handlers::embeddings))
        .route("/v1/images/generations", post(handlers::images_generations))
        .route("/v1/images/edits", post(handlers::images_edits))
        .route("/v1/audio/speech", post(handlers::audio_speech))
        .route("/v1/audio/translations", post(handlers::audio_translations))
        .route(
            "/v1/audio/transcriptions",
            post(handlers::audio_transcriptions),
        )
        .route("/v1/rerank", post(handlers::rerank))
        .route("/v1/responses", post(handlers::responses))
        .route("/v1/models", get(handlers::models_list))
        // Claude messages
        .route("/v1/messages", post(handlers::claude_messages))
        // Gemini generateContent / streamGenerateContent / embedContent
        .route("/v1beta/models/{model_action}", post(handlers::gemini_generate))
        // Realtime over WebSocket
        .route("/v1/realtime", get(realtime::realtime))
        // Vendor task surfaces
        .route("/mj/submit/{action}", post(handlers::task_submit))
        .route("/mj/task/{action}/fetch", any(handlers::task_fetch))
        .route("/suno/submit/{action}", post(handlers::task_submit))
        .route("/suno/fetch", any(handlers::task_fetch))
        .route("/suno/fetch/{id}", any(handlers::task_fetch))
        .route("/video/submit/{action}", post(handlers::task_submit))
        .route("/video/fetch/{id}", any(handlers::task_fetch))
        .layer(middleware::from_fn_with_state(state.clone(), auth::relay_auth))
        .fallback(not_found)
        .with_state(state)
}

/// Unknown routes answer an OpenAI-shaped 404, or redirect when a frontend
/// base URL is configured.
async fn not_found(State(state): State<Arc<AppState>>, request: Request) -> Response {
    if let Some(frontend) = state.global.load().frontend_base_url.as_deref() {
        let target = format!(
            "{}{}",
            frontend,
            request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/")
        );
        return Redirect::permanent(&target).into_response();
    }
    let body = serde_json::json!({
        "error": {
            "message": format!(
                "Invalid URL ({} {})",
                request.method(),
                request.uri().path()
            ),
            "type": "invalid_request_error",
            "param": "",
            "code": "",
        }
    });
    render::json_response(
        StatusCode::NOT_FOUND,
        "",
        serde_json::to_vec(&body).unwrap_or_default(),
    )
}
