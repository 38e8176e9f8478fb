//! Dialect-specific rendering of pipeline errors and relay payloads.

use axum::body::Body;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use tollgate_adapter::{RelayError, RelayFormat, RelayPayload};
use tollgate_common::message_with_request_id;
use tollgate_protocol::claude::ClaudeErrorEnvelope;
use tollgate_protocol::openai::OpenAIErrorEnvelope;

pub const REQUEST_ID_HEADER: &str = "x-tollgate-request-id";

/// Render the final pipeline error in the caller's dialect. The message is
/// already masked by the error's render methods; the request id suffix goes
/// on afterwards.
pub fn error_response(format: RelayFormat, request_id: &str, err: &RelayError) -> Response {
    let status =
        StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = match format {
        RelayFormat::Claude => {
            let mut claude = err.to_claude_error();
            claude.message = message_with_request_id(&claude.message, request_id);
            serde_json::to_vec(&ClaudeErrorEnvelope::new(claude)).unwrap_or_default()
        }
        // A realtime request that never upgraded still answers over HTTP,
        // but with the realtime event framing.
        RelayFormat::OpenAIRealtime => {
            let mut event = err.to_realtime_event();
            event.error.message = message_with_request_id(&event.error.message, request_id);
            serde_json::to_vec(&event).unwrap_or_default()
        }
        RelayFormat::Task | RelayFormat::MjProxy => {
            let mut task = err.to_task_error();
            task.description = message_with_request_id(&task.description, request_id);
            serde_json::to_vec(&task).unwrap_or_default()
        }
        _ => {
            let mut openai = err.to_openai_error();
            openai.message = message_with_request_id(&openai.message, request_id);
            serde_json::to_vec(&OpenAIErrorEnvelope { error: openai }).unwrap_or_default()
        }
    };
    json_response(status, request_id, body)
}

pub fn json_response(status: StatusCode, request_id: &str, body: Vec<u8>) -> Response {
    let mut resp = Response::new(Body::from(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    set_request_id(&mut resp, request_id);
    resp
}

/// Turn a pipeline payload into the HTTP response, bridging stream bodies
/// through the mpsc receiver.
pub fn payload_response(payload: RelayPayload, request_id: &str) -> Response {
    match payload {
        RelayPayload::Buffered {
            status,
            headers,
            body,
        } => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            extend_headers(&mut resp, &headers);
            set_request_id(&mut resp, request_id);
            resp
        }
        RelayPayload::Stream {
            status,
            headers,
            content_type,
            body,
        } => {
            let stream = ReceiverStream::new(body).map(Ok::<_, std::io::Error>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            extend_headers(&mut resp, &headers);
            resp.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(content_type),
            );
            set_request_id(&mut resp, request_id);
            resp
        }
    }
}

fn extend_headers(resp: &mut Response, headers: &[(String, String)]) {
    for (name, value) in headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        resp.headers_mut().insert(name, value);
    }
}

fn set_request_id(resp: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
}
