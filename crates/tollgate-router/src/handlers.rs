//! Dialect handlers: parse the inbound body into the canonical envelope,
//! pin the initial channel, and run the pipeline.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use axum::Extension;
use bytes::Bytes;
use serde_json::json;
use tracing::info;

use tollgate_adapter::{
    ErrorKind, ParsedRequest, RelayEnvelope, RelayError, RelayFormat, RelayInfo, RelayMode,
};
use tollgate_relay::{apply_selection, select_channel, AppState, AuthContext, RelayPipeline};

use crate::auth::RequestId;
use crate::render::{error_response, json_response, payload_response};

fn parse_json<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T, RelayError> {
    serde_json::from_slice(body).map_err(|err| RelayError::new(ErrorKind::InvalidRequest, err))
}

fn envelope_from(parsed: ParsedRequest, body: Bytes, content_type: &str) -> RelayEnvelope {
    RelayEnvelope {
        parsed,
        raw_body: body,
        content_type: content_type.to_string(),
    }
}

/// Build the per-request ledger, pin the first channel, run the pipeline,
/// and render the outcome in the caller's dialect.
#[allow(clippy::too_many_arguments)]
async fn relay_request(
    state: Arc<AppState>,
    auth: AuthContext,
    request_id: String,
    format: RelayFormat,
    mode: RelayMode,
    model: String,
    path: String,
    envelope: RelayEnvelope,
) -> Response {
    run_relay(
        state, auth, request_id, format, mode, model, path, envelope, false,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn run_relay(
    state: Arc<AppState>,
    auth: AuthContext,
    request_id: String,
    format: RelayFormat,
    mode: RelayMode,
    model: String,
    path: String,
    envelope: RelayEnvelope,
    stream_hint: bool,
) -> Response {
    let mut relay_info = RelayInfo::new(request_id.clone(), format, mode, model);
    relay_info.user_id = auth.user_id;
    relay_info.token_id = auth.token_id;
    relay_info.group = auth.group;
    relay_info.request_url_path = path;
    relay_info.is_stream = stream_hint || envelope.is_stream();

    match select_channel(
        &state.cache,
        &relay_info.group,
        &relay_info.original_model,
        &[],
    ) {
        Ok(selected) => apply_selection(&mut relay_info, &selected),
        Err(err) => return error_response(format, &request_id, &err),
    }
    info!(
        event = "relay_request",
        request_id = %request_id,
        mode = relay_info.mode.as_str(),
        model = %relay_info.original_model,
        channel = relay_info.channel_id,
        is_stream = relay_info.is_stream,
    );

    let pipeline = RelayPipeline::new(state);
    match pipeline.handle(&mut relay_info, &envelope).await {
        Ok(payload) => payload_response(payload, &request_id),
        Err(err) => error_response(format, &request_id, &err),
    }
}

macro_rules! try_parse {
    ($format:expr, $request_id:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(err) => return error_response($format, &$request_id, &err),
        }
    };
}

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::ChatCompletionRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Chat(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::ChatCompletions,
        model,
        "/v1/chat/completions".into(),
        envelope,
    )
    .await
}

pub async fn completions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::CompletionRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Completion(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::Completions,
        model,
        "/v1/completions".into(),
        envelope,
    )
    .await
}

pub async fn embeddings(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::EmbeddingRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Embedding(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::Embeddings,
        model,
        "/v1/embeddings".into(),
        envelope,
    )
    .await
}

pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::ImageRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Image(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::ImagesGenerations,
        model,
        "/v1/images/generations".into(),
        envelope,
    )
    .await
}

/// Image edits arrive either as JSON (re-framed by the adapter) or as
/// multipart, which passes through byte-identical with only the model field
/// lifted out for routing.
pub async fn images_edits(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    multipart_or_json(
        state,
        auth,
        request_id,
        RelayMode::ImagesEdits,
        "/v1/images/edits".into(),
        headers,
        body,
    )
    .await
}

pub async fn audio_speech(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::AudioRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Audio(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::AudioSpeech,
        model,
        "/v1/audio/speech".into(),
        envelope,
    )
    .await
}

pub async fn audio_transcriptions(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    multipart_or_json(
        state,
        auth,
        request_id,
        RelayMode::AudioTranscription,
        "/v1/audio/transcriptions".into(),
        headers,
        body,
    )
    .await
}

pub async fn audio_translations(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    multipart_or_json(
        state,
        auth,
        request_id,
        RelayMode::AudioTranslation,
        "/v1/audio/translations".into(),
        headers,
        body,
    )
    .await
}

pub async fn rerank(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::RerankRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Rerank(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::Rerank,
        model,
        "/v1/rerank".into(),
        envelope,
    )
    .await
}

pub async fn responses(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::openai::ResponsesRequest =
        try_parse!(RelayFormat::OpenAI, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Responses(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        RelayMode::Responses,
        model,
        "/v1/responses".into(),
        envelope,
    )
    .await
}

pub async fn claude_messages(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let req: tollgate_protocol::claude::ClaudeMessagesRequest =
        try_parse!(RelayFormat::Claude, request_id, parse_json(&body));
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Claude(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::Claude,
        RelayMode::ChatCompletions,
        model,
        "/v1/messages".into(),
        envelope,
    )
    .await
}

/// `/v1beta/models/{model}:{action}` — the Gemini action rides in the final
/// path segment after a colon.
pub async fn gemini_generate(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(model_action): Path<String>,
    Query(query): Query<std::collections::HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        let err = RelayError::new(
            ErrorKind::InvalidRequest,
            "expected models/{model}:{action}",
        );
        return error_response(RelayFormat::Gemini, &request_id, &err);
    };
    let model = model.to_string();
    let path = format!("/v1beta/models/{model_action}");
    match action {
        "generateContent" | "streamGenerateContent" => {
            let req: tollgate_protocol::gemini::GenerateContentRequest =
                try_parse!(RelayFormat::Gemini, request_id, parse_json(&body));
            let envelope =
                envelope_from(ParsedRequest::GeminiGenerate(req), body, "application/json");
            let stream = action == "streamGenerateContent"
                || query.get("alt").map(String::as_str) == Some("sse");
            run_relay(
                state,
                auth,
                request_id,
                RelayFormat::Gemini,
                RelayMode::ChatCompletions,
                model,
                path,
                envelope,
                stream,
            )
            .await
        }
        "embedContent" => {
            let req: tollgate_protocol::gemini::EmbedContentRequest =
                try_parse!(RelayFormat::Gemini, request_id, parse_json(&body));
            let envelope =
                envelope_from(ParsedRequest::GeminiEmbed(req), body, "application/json");
            relay_request(
                state,
                auth,
                request_id,
                RelayFormat::Gemini,
                RelayMode::Embeddings,
                model,
                path,
                envelope,
            )
            .await
        }
        other => {
            let err = RelayError::new(
                ErrorKind::InvalidRequest,
                format!("unsupported gemini action: {other}"),
            )
            .with_status(404);
            error_response(RelayFormat::Gemini, &request_id, &err)
        }
    }
}

pub async fn task_submit(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Path(action): Path<String>,
    uri: axum::http::Uri,
    body: Bytes,
) -> Response {
    let format = task_format(uri.path());
    let req: tollgate_protocol::task::TaskSubmitRequest =
        try_parse!(format, request_id, parse_json(&body));
    let model = req
        .model
        .clone()
        .unwrap_or_else(|| task_model(uri.path(), &action));
    let path = uri.path().to_string();
    let envelope = envelope_from(ParsedRequest::Task(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        format,
        RelayMode::TaskSubmit,
        model,
        path,
        envelope,
    )
    .await
}

pub async fn task_fetch(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    uri: axum::http::Uri,
    body: Bytes,
) -> Response {
    let format = task_format(uri.path());
    let model = task_model(uri.path(), "");
    let path = uri.path().to_string();
    let envelope = envelope_from(ParsedRequest::Raw, body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        format,
        RelayMode::TaskFetch,
        model,
        path,
        envelope,
    )
    .await
}

fn task_format(path: &str) -> RelayFormat {
    if path.starts_with("/mj/") {
        RelayFormat::MjProxy
    } else {
        RelayFormat::Task
    }
}

/// Routing model for task dialects, derived from the surface and the submit
/// action the way the channel abilities are provisioned.
fn task_model(path: &str, action: &str) -> String {
    if path.starts_with("/mj/") {
        if action.is_empty() {
            "mj_imagine".to_string()
        } else {
            format!("mj_{action}")
        }
    } else if path.starts_with("/video/") {
        "video_generate".to_string()
    } else if action.is_empty() {
        "suno_music".to_string()
    } else {
        format!("suno_{action}")
    }
}

/// Capability listing for the caller's group: the provisioned abilities,
/// plus each eligible channel's advertised models when the channel carries
/// no explicit allowlist.
pub async fn models_list(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
) -> Response {
    let index = state.cache.load();
    let mut models: Vec<String> = index
        .by_group_model
        .keys()
        .filter(|(group, _)| group == &auth.group)
        .map(|(_, model)| model.clone())
        .collect();
    for channel in index.channels.values() {
        if !channel.is_enabled()
            || !channel.groups.iter().any(|group| group == &auth.group)
            || !channel.models.is_empty()
        {
            continue;
        }
        if let Some(channel_type) = tollgate_adapter::ChannelType::from_i32(channel.channel_type)
        {
            models.extend(tollgate_adapter::adapter_for(channel_type).models());
        }
    }
    models.sort_unstable();
    models.dedup();
    let data: Vec<_> = models
        .into_iter()
        .map(|model| json!({"id": model, "object": "model", "owned_by": "tollgate"}))
        .collect();
    let body = serde_json::to_vec(&json!({"object": "list", "data": data})).unwrap_or_default();
    json_response(StatusCode::OK, &request_id, body)
}

async fn multipart_or_json(
    state: Arc<AppState>,
    auth: AuthContext,
    request_id: String,
    mode: RelayMode,
    path: String,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/json")
        .to_string();

    if let Some(boundary) = multipart_boundary(&content_type) {
        let Some(model) = multipart_text_field(&body, &boundary, "model") else {
            let err = RelayError::new(ErrorKind::InvalidRequest, "multipart form has no model");
            return error_response(RelayFormat::OpenAI, &request_id, &err);
        };
        let envelope = envelope_from(ParsedRequest::Raw, body, &content_type);
        return relay_request(
            state,
            auth,
            request_id,
            RelayFormat::OpenAI,
            mode,
            model,
            path,
            envelope,
        )
        .await;
    }

    let req: tollgate_protocol::openai::ImageRequest = match parse_json(&body) {
        Ok(req) => req,
        Err(err) => return error_response(RelayFormat::OpenAI, &request_id, &err),
    };
    let model = req.model.clone();
    let envelope = envelope_from(ParsedRequest::Image(req), body, "application/json");
    relay_request(
        state,
        auth,
        request_id,
        RelayFormat::OpenAI,
        mode,
        model,
        path,
        envelope,
    )
    .await
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    if !content_type.starts_with("multipart/form-data") {
        return None;
    }
    content_type.split(';').find_map(|part| {
        part.trim()
            .strip_prefix("boundary=")
            .map(|boundary| boundary.trim_matches('"').to_string())
    })
}

/// Minimal text-field extraction; binary parts are skipped by the header
/// check, and the body itself is forwarded untouched.
fn multipart_text_field(body: &[u8], boundary: &str, name: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let delimiter = format!("--{boundary}");
    let marker = format!("name=\"{name}\"");
    for part in text.split(delimiter.as_str()) {
        let Some((head, value)) = part.split_once("\r\n\r\n") else {
            continue;
        };
        if head.contains(&marker) && !head.contains("filename=") {
            return Some(value.trim_end_matches(['\r', '\n', '-']).trim().to_string());
        }
    }
    None
}
