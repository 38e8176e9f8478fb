use bytes::Bytes;
use serde_json::{json, Value};

use tollgate_protocol::gemini::{EmbedContentRequest, GenerateContentRequest};
use tollgate_protocol::openai::{ChatCompletionRequest, Usage};
use tollgate_protocol::sse::{encode_event, SseEvent};

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::{ErrorKind, RelayError};
use crate::info::{RelayFormat, RelayInfo, RelayMode};
use crate::openai::passthrough_headers;
use crate::stream::{
    relay_sse_stream, AdapterResponse, EventMapper, GeminiStreamProbe, RelayPayload, UsageHandle,
};
use crate::upstream::{header_set, Headers, UpstreamBody, UpstreamHttpResponse};

/// Google Gemini generative language API.
#[derive(Debug, Default)]
pub struct GeminiAdapter;

impl ChannelAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "gemini-2.0-flash".into(),
            "gemini-2.5-pro".into(),
            "text-embedding-004".into(),
        ]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        let model = &info.upstream_model;
        match info.mode {
            RelayMode::ChatCompletions if info.is_stream => Ok(format!(
                "{}/v1beta/models/{model}:streamGenerateContent?alt=sse",
                info.base_url
            )),
            RelayMode::ChatCompletions => Ok(format!(
                "{}/v1beta/models/{model}:generateContent",
                info.base_url
            )),
            RelayMode::Embeddings => Ok(format!(
                "{}/v1beta/models/{model}:embedContent",
                info.base_url
            )),
            other => Err(RelayError::unsupported(other.as_str())),
        }
    }

    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError> {
        header_set(headers, "x-goog-api-key", info.api_key.clone());
        Ok(())
    }

    fn convert_gemini(
        &self,
        _info: &mut RelayInfo,
        req: GenerateContentRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn convert_gemini_embed(
        &self,
        _info: &mut RelayInfo,
        req: EmbedContentRequest,
    ) -> Result<ConvertedBody, RelayError> {
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
        let converted = openai_to_gemini_request(&req);
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
                let value: Value = serde_json::from_slice(&body)
                    .map_err(|err| RelayError::new(ErrorKind::StreamDecodeError, err))?;
                let usage = gemini_usage(&value, info.prompt_tokens);
                let body = match info.format {
                    RelayFormat::Gemini => body,
                    _ => Bytes::from(
                        serde_json::to_vec(&gemini_to_openai_response(
                            &value,
                            &info.upstream_model,
                            &usage,
                        ))
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
                    RelayFormat::Gemini => None,
                    _ => Some(gemini_to_openai_chunk_mapper(
                        info.upstream_model.clone(),
                        info.request_id.clone(),
                    )),
                };
                let (body, done) = relay_sse_stream(
                    rx,
                    Box::<GeminiStreamProbe>::default(),
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

fn openai_to_gemini_request(req: &ChatCompletionRequest) -> Value {
    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in &req.messages {
        let text = message.content.plain_text();
        match message.role.as_str() {
            "system" | "developer" => system_parts.push(json!({"text": text})),
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }
    let mut out = json!({"contents": contents});
    if !system_parts.is_empty() {
        out["systemInstruction"] = json!({"parts": system_parts});
    }
    let mut generation_config = serde_json::Map::new();
    if let Some(temperature) = req.extra.get("temperature") {
        generation_config.insert("temperature".into(), temperature.clone());
    }
    if let Some(top_p) = req.extra.get("top_p") {
        generation_config.insert("topP".into(), top_p.clone());
    }
    if let Some(max_tokens) = req.extra.get("max_tokens") {
        generation_config.insert("maxOutputTokens".into(), max_tokens.clone());
    }
    if !generation_config.is_empty() {
        out["generationConfig"] = Value::Object(generation_config);
    }
    out
}

fn gemini_usage(value: &Value, prompt_tokens: i64) -> Usage {
    let meta = value.get("usageMetadata");
    let prompt = meta
        .and_then(|m| m.get("promptTokenCount"))
        .and_then(Value::as_i64)
        .unwrap_or(prompt_tokens);
    let completion = meta
        .and_then(|m| m.get("candidatesTokenCount"))
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Usage::new(prompt, completion)
}

fn candidate_text(value: &Value) -> String {
    value
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

fn gemini_to_openai_response(value: &Value, model: &str, usage: &Usage) -> Value {
    json!({
        "id": "chatcmpl-gemini",
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": candidate_text(value)},
            "finish_reason": "stop",
        }],
        "usage": usage,
    })
}

/// Gemini stream frames → OpenAI chat chunks. Every frame with candidate
/// text becomes a delta; the finish-reason frame closes the stream.
fn gemini_to_openai_chunk_mapper(model: String, request_id: String) -> EventMapper {
    let mut finished = false;
    Box::new(move |event: &SseEvent| -> Vec<Bytes> {
        let Ok(value) = serde_json::from_str::<Value>(&event.data) else {
            return Vec::new();
        };
        let chunk = |delta: Value, finish: Value| {
            encode_event(&SseEvent {
                event: None,
                data: json!({
                    "id": format!("chatcmpl-{request_id}"),
                    "object": "chat.completion.chunk",
                    "model": model,
                    "choices": [{"index": 0, "delta": delta, "finish_reason": finish}],
                })
                .to_string(),
            })
        };
        let mut frames = Vec::new();
        let text = candidate_text(&value);
        if !text.is_empty() {
            frames.push(chunk(json!({"content": text}), Value::Null));
        }
        let finish = value
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str);
        if finish.is_some() && !finished {
            finished = true;
            frames.push(chunk(json!({}), Value::String("stop".into())));
            frames.push(Bytes::from_static(b"data: [DONE]\n\n"));
        }
        frames
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: RelayFormat, stream: bool) -> RelayInfo {
        let mut info = RelayInfo::new(
            "req-1".into(),
            format,
            RelayMode::ChatCompletions,
            "gemini-2.0-flash".into(),
        );
        info.base_url = "https://gemini.example".into();
        info.api_key = "g-key".into();
        info.is_stream = stream;
        info
    }

    #[test]
    fn url_switches_on_stream_and_mode() {
        let adapter = GeminiAdapter;
        assert_eq!(
            adapter.url(&info(RelayFormat::Gemini, false)).unwrap(),
            "https://gemini.example/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            adapter.url(&info(RelayFormat::Gemini, true)).unwrap(),
            "https://gemini.example/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
        let mut embed = info(RelayFormat::Gemini, false);
        embed.mode = RelayMode::Embeddings;
        assert_eq!(
            adapter.url(&embed).unwrap(),
            "https://gemini.example/v1beta/models/gemini-2.0-flash:embedContent"
        );
    }

    #[test]
    fn openai_request_translation_builds_contents() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gemini-2.0-flash",
            "messages": [
                {"role": "system", "content": "short answers"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ],
            "temperature": 0.7,
            "max_tokens": 32,
        }))
        .unwrap();
        let out = openai_to_gemini_request(&req);
        assert_eq!(out["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(out["contents"][1]["role"], "model");
        assert_eq!(out["generationConfig"]["maxOutputTokens"], 32);
    }

    #[test]
    fn buffered_response_translates_for_openai_callers() {
        let adapter = GeminiAdapter;
        let mut info = info(RelayFormat::OpenAI, false);
        info.prompt_tokens = 5;
        let body = json!({
            "candidates": [{"content": {"parts": [{"text": "answer"}]}, "finishReason": "STOP"}],
            "usageMetadata": {"promptTokenCount": 5, "candidatesTokenCount": 2, "totalTokenCount": 7},
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
        assert_eq!(value["choices"][0]["message"]["content"], "answer");
        assert_eq!(value["usage"]["completion_tokens"], 2);
    }

    #[test]
    fn chunk_mapper_emits_done_once() {
        let mut mapper = gemini_to_openai_chunk_mapper("m".into(), "r".into());
        let frame = json!({
            "candidates": [{"content": {"parts": [{"text": "hi"}]}, "finishReason": "STOP"}],
        });
        let frames = mapper(&SseEvent {
            event: None,
            data: frame.to_string(),
        });
        assert_eq!(frames.len(), 3);
        let repeat = mapper(&SseEvent {
            event: None,
            data: frame.to_string(),
        });
        // Delta still flows, but stop/done only fire once.
        assert_eq!(repeat.len(), 1);
    }
}
