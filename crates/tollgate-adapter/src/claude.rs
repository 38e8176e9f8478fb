use bytes::Bytes;
use serde_json::{json, Value};

use tollgate_protocol::claude::{ClaudeMessagesRequest, ClaudeMessagesResponse};
use tollgate_protocol::openai::{ChatCompletionRequest, MessageContent, Usage};
use tollgate_protocol::sse::{encode_event, SseEvent};

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::{ErrorKind, RelayError};
use crate::info::{RelayFormat, RelayInfo, RelayMode};
use crate::openai::passthrough_headers;
use crate::stream::{
    relay_sse_stream, AdapterResponse, ClaudeStreamProbe, EventMapper, RelayPayload, UsageHandle,
};
use crate::upstream::{header_set, Headers, UpstreamBody, UpstreamHttpResponse};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

/// Anthropic messages API. Serves the Claude dialect natively and the OpenAI
/// chat dialect through request/response translation.
#[derive(Debug, Default)]
pub struct ClaudeAdapter;

impl ChannelAdapter for ClaudeAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "claude-sonnet-4-20250514".into(),
            "claude-opus-4-20250514".into(),
            "claude-3-5-haiku-20241022".into(),
        ]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        match info.mode {
            RelayMode::ChatCompletions => Ok(format!("{}/v1/messages", info.base_url)),
            other => Err(RelayError::unsupported(other.as_str())),
        }
    }

    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError> {
        header_set(headers, "x-api-key", info.api_key.clone());
        header_set(headers, "anthropic-version", ANTHROPIC_VERSION);
        Ok(())
    }

    fn convert_claude(
        &self,
        info: &mut RelayInfo,
        req: ClaudeMessagesRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.is_stream() {
            info.is_stream = true;
        }
        ConvertedBody::json(&req)
    }

    fn convert_openai(
        &self,
        info: &mut RelayInfo,
        req: ChatCompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.is_stream() {
            info.is_stream = true;
        }
        let converted = openai_to_claude_request(&req)?;
        ConvertedBody::json(&converted)
    }

    fn respond(
        &self,
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
                let parsed: ClaudeMessagesResponse =
                    serde_json::from_slice(&body).map_err(|err| {
                        RelayError::new(ErrorKind::StreamDecodeError, err)
                    })?;
                let usage = parsed
                    .usage
                    .as_ref()
                    .map(|u| Usage::new(u.input_tokens, u.output_tokens))
                    .unwrap_or_else(|| Usage::new(info.prompt_tokens, 0));
                let body = match info.format {
                    RelayFormat::Claude => body,
                    _ => Bytes::from(
                        serde_json::to_vec(&claude_to_openai_response(&parsed, &usage))
                            .map_err(RelayError::internal)?,
                    ),
                };
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
                let mapper: Option<EventMapper> = match info.format {
                    RelayFormat::Claude => None,
                    _ => Some(claude_to_openai_chunk_mapper(
                        info.upstream_model.clone(),
                        info.request_id.clone(),
                    )),
                };
                let (body, done) = relay_sse_stream(
                    rx,
                    Box::<ClaudeStreamProbe>::default(),
                    info.prompt_tokens,
                    mapper,
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
}

/// OpenAI chat request → Claude messages request. System messages collapse
/// into the `system` field; assistant/user turns map across directly.
fn openai_to_claude_request(req: &ChatCompletionRequest) -> Result<Value, RelayError> {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();
    for message in &req.messages {
        let text = message.content.plain_text();
        match message.role.as_str() {
            "system" | "developer" => system_parts.push(text),
            "assistant" => messages.push(json!({"role": "assistant", "content": text})),
            _ => messages.push(json!({
                "role": "user",
                "content": claude_content_blocks(&message.content),
            })),
        }
    }
    let max_tokens = req
        .extra
        .get("max_tokens")
        .or_else(|| req.extra.get("max_completion_tokens"))
        .and_then(Value::as_i64)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut out = json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": max_tokens,
    });
    if !system_parts.is_empty() {
        out["system"] = Value::String(system_parts.join("\n"));
    }
    if let Some(stream) = req.stream {
        out["stream"] = Value::Bool(stream);
    }
    if let Some(temperature) = req.extra.get("temperature") {
        out["temperature"] = temperature.clone();
    }
    if let Some(top_p) = req.extra.get("top_p") {
        out["top_p"] = top_p.clone();
    }
    Ok(out)
}

fn claude_content_blocks(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Parts(_) => Value::String(content.plain_text()),
    }
}

/// Claude buffered response → OpenAI chat completion envelope.
fn claude_to_openai_response(resp: &ClaudeMessagesResponse, usage: &Usage) -> Value {
    let text = resp
        .content
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    json!({
        "id": resp.id,
        "object": "chat.completion",
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop",
        }],
        "usage": usage,
    })
}

/// Frame-level translation of a Claude event stream into OpenAI chat chunks.
/// Text deltas become chunk deltas, `message_stop` closes the stream with a
/// finish chunk and the `[DONE]` sentinel; housekeeping events drop.
fn claude_to_openai_chunk_mapper(model: String, request_id: String) -> EventMapper {
    Box::new(move |event: &SseEvent| -> Vec<Bytes> {
        let chunk = |payload: Value| {
            encode_event(&SseEvent {
                event: None,
                data: payload.to_string(),
            })
        };
        let base = |delta: Value, finish: Value| {
            json!({
                "id": format!("chatcmpl-{request_id}"),
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
            })
        };
        match event.event.as_deref() {
            Some("message_start") => {
                vec![chunk(base(json!({"role": "assistant", "content": ""}), Value::Null))]
            }
            Some("content_block_delta") => {
                let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
                    return Vec::new();
                };
                match value.pointer("/delta/text").and_then(Value::as_str) {
                    Some(text) => {
                        vec![chunk(base(json!({"content": text}), Value::Null))]
                    }
                    None => Vec::new(),
                }
            }
            Some("message_stop") => vec![
                chunk(base(json!({}), Value::String("stop".into()))),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ],
            _ => Vec::new(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: RelayFormat) -> RelayInfo {
        let mut info = RelayInfo::new(
            "req-1".into(),
            format,
            RelayMode::ChatCompletions,
            "claude-3-5-haiku-20241022".into(),
        );
        info.base_url = "https://anthropic.example".into();
        info.api_key = "sk-ant".into();
        info
    }

    #[test]
    fn headers_carry_api_key_and_version() {
        let adapter = ClaudeAdapter;
        let mut headers = Vec::new();
        adapter.headers(&info(RelayFormat::Claude), &mut headers).unwrap();
        assert_eq!(
            crate::upstream::header_get(&headers, "x-api-key"),
            Some("sk-ant")
        );
        assert_eq!(
            crate::upstream::header_get(&headers, "anthropic-version"),
            Some(ANTHROPIC_VERSION)
        );
    }

    #[test]
    fn openai_request_translation() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "claude-3-5-haiku-20241022",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hello"},
            ],
            "max_tokens": 64,
            "temperature": 0.3,
        }))
        .unwrap();
        let out = openai_to_claude_request(&req).unwrap();
        assert_eq!(out["system"], "be terse");
        assert_eq!(out["max_tokens"], 64);
        assert_eq!(out["temperature"], 0.3);
        assert_eq!(out["messages"][0]["role"], "user");
    }

    #[test]
    fn stream_mapper_translates_deltas_and_stop() {
        let mut mapper = claude_to_openai_chunk_mapper("m".into(), "req-1".into());
        let frames = mapper(&SseEvent {
            event: Some("content_block_delta".into()),
            data: json!({"delta": {"type": "text_delta", "text": "hi"}}).to_string(),
        });
        assert_eq!(frames.len(), 1);
        let text = String::from_utf8(frames[0].to_vec()).unwrap();
        assert!(text.contains("\"content\":\"hi\""));

        let frames = mapper(&SseEvent {
            event: Some("message_stop".into()),
            data: "{}".into(),
        });
        assert_eq!(frames.len(), 2);
        assert!(String::from_utf8(frames[1].to_vec()).unwrap().contains("[DONE]"));

        assert!(mapper(&SseEvent {
            event: Some("ping".into()),
            data: "{}".into(),
        })
        .is_empty());
    }

    #[test]
    fn buffered_claude_response_translates_for_openai_callers() {
        let adapter = ClaudeAdapter;
        let mut info = info(RelayFormat::OpenAI);
        let body = json!({
            "id": "msg_1",
            "model": "claude-3-5-haiku-20241022",
            "content": [{"type": "text", "text": "hello there"}],
            "usage": {"input_tokens": 9, "output_tokens": 3},
        });
        let resp = UpstreamHttpResponse {
            status: 200,
            headers: Vec::new(),
            body: UpstreamBody::Bytes(Bytes::from(serde_json::to_vec(&body).unwrap())),
        };
        let out = adapter.respond(&mut info, resp).unwrap();
        let RelayPayload::Buffered { body, .. } = out.payload else {
            panic!("expected buffered payload");
        };
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["object"], "chat.completion");
        assert_eq!(value["choices"][0]["message"]["content"], "hello there");
        match out.usage {
            UsageHandle::Immediate(usage) => {
                assert_eq!(usage.prompt_tokens, 9);
                assert_eq!(usage.completion_tokens, 3);
            }
            UsageHandle::Deferred(_) => panic!("expected immediate usage"),
        }
    }
}
