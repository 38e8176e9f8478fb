use serde_json::Value;

use tollgate_protocol::openai::{
    AudioRequest, ChatCompletionRequest, CompletionRequest, EmbeddingRequest, ImageRequest,
    RerankRequest, ResponsesRequest, Usage,
};

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::RelayError;
use crate::info::{RelayInfo, RelayMode};
use crate::stream::{
    relay_sse_stream, AdapterResponse, OpenAiStreamProbe, RelayPayload, UsageHandle,
};
use crate::upstream::{header_set, Headers, UpstreamBody, UpstreamHttpResponse};

/// OpenAI-compatible upstreams: the base URL plus the standard `/v1` paths.
#[derive(Debug, Default)]
pub struct OpenAiAdapter;

pub(crate) fn api_path(mode: RelayMode) -> Result<&'static str, RelayError> {
    Ok(match mode {
        RelayMode::ChatCompletions => "/v1/chat/completions",
        RelayMode::Completions => "/v1/completions",
        RelayMode::Embeddings => "/v1/embeddings",
        RelayMode::ImagesGenerations => "/v1/images/generations",
        RelayMode::ImagesEdits => "/v1/images/edits",
        RelayMode::AudioSpeech => "/v1/audio/speech",
        RelayMode::AudioTranslation => "/v1/audio/translations",
        RelayMode::AudioTranscription => "/v1/audio/transcriptions",
        RelayMode::Rerank => "/v1/rerank",
        RelayMode::Responses => "/v1/responses",
        other => return Err(RelayError::unsupported(other.as_str())),
    })
}

impl ChannelAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "gpt-4o".into(),
            "gpt-4o-mini".into(),
            "gpt-4.1".into(),
            "o3-mini".into(),
            "text-embedding-3-small".into(),
            "text-embedding-3-large".into(),
            "whisper-1".into(),
            "tts-1".into(),
            "dall-e-3".into(),
        ]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        Ok(format!("{}{}", info.base_url, api_path(info.mode)?))
    }

    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError> {
        header_set(headers, "Authorization", format!("Bearer {}", info.api_key));
        Ok(())
    }

    fn convert_openai(
        &self,
        info: &mut RelayInfo,
        mut req: ChatCompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.is_stream() {
            info.is_stream = true;
            // Ask for usage on the final chunk so settlement does not have to
            // re-count the completion text.
            req.extra
                .entry("stream_options".to_string())
                .or_insert_with(|| serde_json::json!({"include_usage": true}));
        }
        ConvertedBody::json(&req)
    }

    fn convert_completion(
        &self,
        info: &mut RelayInfo,
        req: CompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.stream.unwrap_or(false) {
            info.is_stream = true;
        }
        ConvertedBody::json(&req)
    }

    fn convert_embedding(
        &self,
        _info: &mut RelayInfo,
        req: EmbeddingRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn convert_image(
        &self,
        _info: &mut RelayInfo,
        req: ImageRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn convert_audio(
        &self,
        _info: &mut RelayInfo,
        req: AudioRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn convert_rerank(
        &self,
        _mode: RelayMode,
        req: RerankRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn convert_responses(
        &self,
        info: &mut RelayInfo,
        req: ResponsesRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.stream.unwrap_or(false) {
            info.is_stream = true;
        }
        ConvertedBody::json(&req)
    }

    fn respond(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
    ) -> Result<AdapterResponse, RelayError> {
        respond_openai_style(info, resp)
    }
}

/// Shared response handling for every upstream that answers in the OpenAI
/// shape. Streams pipe through verbatim with a usage tap; buffered bodies
/// pass through with usage lifted from the standard `usage` object.
pub(crate) fn respond_openai_style(
    info: &mut RelayInfo,
    resp: UpstreamHttpResponse,
) -> Result<AdapterResponse, RelayError> {
    let status = resp.status;
    match resp.body {
        UpstreamBody::Bytes(body) => {
            if !(200..300).contains(&status) {
                return Err(RelayError::channel_response(
                    status,
                    crate::common::upstream_error_message(&body),
                ));
            }
            let usage = buffered_usage(&body, info.prompt_tokens);
            Ok(AdapterResponse {
                payload: RelayPayload::Buffered {
                    status,
                    headers: passthrough_headers(&resp.headers),
                    body,
                },
                usage: UsageHandle::Immediate(usage),
            })
        }
        UpstreamBody::Stream(rx) => {
            let (body, done) = relay_sse_stream(
                rx,
                Box::<OpenAiStreamProbe>::default(),
                info.prompt_tokens,
                None,
            );
            Ok(AdapterResponse {
                payload: RelayPayload::Stream {
                    status,
                    headers: passthrough_headers(&resp.headers),
                    content_type: "text/event-stream",
                    body,
                },
                usage: UsageHandle::Deferred(done),
            })
        }
    }
}

/// Usage from a buffered OpenAI-shaped body; prompt falls back to the counted
/// estimate when the upstream omits the object.
pub(crate) fn buffered_usage(body: &[u8], prompt_tokens: i64) -> Usage {
    let Ok(value) = serde_json::from_slice::<Value>(body) else {
        return Usage::new(prompt_tokens, 0);
    };
    let usage = value.get("usage");
    let prompt = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(prompt_tokens);
    let completion = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

/// Response headers worth forwarding; connection management is the server's
/// own business.
pub(crate) fn passthrough_headers(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| {
            !name.eq_ignore_ascii_case("content-length")
                && !name.eq_ignore_ascii_case("transfer-encoding")
                && !name.eq_ignore_ascii_case("connection")
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::RelayFormat;
    use bytes::Bytes;

    fn chat_info() -> RelayInfo {
        let mut info = RelayInfo::new(
            "r".into(),
            RelayFormat::OpenAI,
            RelayMode::ChatCompletions,
            "gpt-x".into(),
        );
        info.base_url = "https://upstream.example".into();
        info.api_key = "sk-test".into();
        info
    }

    #[test]
    fn url_per_mode() {
        let adapter = OpenAiAdapter;
        let mut info = chat_info();
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://upstream.example/v1/chat/completions"
        );
        info.mode = RelayMode::Embeddings;
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://upstream.example/v1/embeddings"
        );
        info.mode = RelayMode::Realtime;
        assert!(adapter.url(&info).is_err());
    }

    #[test]
    fn stream_request_forces_usage_option() {
        let adapter = OpenAiAdapter;
        let mut info = chat_info();
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-x",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .unwrap();
        let body = adapter.convert_openai(&mut info, req).unwrap();
        assert!(info.is_stream);
        let value: Value = serde_json::from_slice(&body.bytes).unwrap();
        assert_eq!(value["stream_options"]["include_usage"], Value::Bool(true));
    }

    #[test]
    fn error_status_becomes_channel_error() {
        let mut info = chat_info();
        let resp = UpstreamHttpResponse {
            status: 429,
            headers: Vec::new(),
            body: UpstreamBody::Bytes(Bytes::from_static(
                br#"{"error":{"message":"rate limited"}}"#,
            )),
        };
        let err = respond_openai_style(&mut info, resp).unwrap_err();
        assert_eq!(err.status, 429);
        assert_eq!(err.kind, crate::error::ErrorKind::ChannelResponseError);
        assert_eq!(err.message, "rate limited");
    }

    #[test]
    fn buffered_usage_falls_back_to_counted_prompt() {
        let usage = buffered_usage(br#"{"choices":[]}"#, 42);
        assert_eq!(usage.prompt_tokens, 42);
        assert_eq!(usage.completion_tokens, 0);
        let usage = buffered_usage(
            br#"{"usage":{"prompt_tokens":7,"completion_tokens":3,"total_tokens":10}}"#,
            42,
        );
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
    }
}
