use serde_json::{json, Value};

use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::openai::{
    ChatCompletionRequest, EmbeddingRequest, ImageRequest, RerankRequest, Usage,
};

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::RelayError;
use crate::info::{RelayFormat, RelayInfo, RelayMode};
use crate::openai::{passthrough_headers, respond_openai_style};
use crate::stream::{AdapterResponse, RelayPayload, UsageHandle};
use crate::upstream::{header_set, Headers, UpstreamBody, UpstreamHttpResponse};

/// Ali DashScope. Chat and embeddings ride the OpenAI-compatible surface;
/// images and rerank use the native DashScope services, and a Claude-shaped
/// app endpoint serves the Claude dialect.
#[derive(Debug, Default)]
pub struct AliAdapter;

impl ChannelAdapter for AliAdapter {
    fn name(&self) -> &'static str {
        "ali"
    }

    fn models(&self) -> Vec<String> {
        vec![
            "qwen-max".into(),
            "qwen-plus".into(),
            "qwen-turbo".into(),
            "qwen3-max-thinking".into(),
            "text-embedding-v3".into(),
            "wanx2.1-t2i-turbo".into(),
            "gte-rerank".into(),
        ]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        if info.format == RelayFormat::Claude {
            return Ok(format!(
                "{}/api/v2/apps/claude-code-proxy/v1/messages",
                info.base_url
            ));
        }
        Ok(match info.mode {
            RelayMode::Embeddings => {
                format!("{}/compatible-mode/v1/embeddings", info.base_url)
            }
            RelayMode::Rerank => format!(
                "{}/api/v1/services/rerank/text-rerank/text-rerank",
                info.base_url
            ),
            RelayMode::ImagesGenerations => format!(
                "{}/api/v1/services/aigc/text2image/image-synthesis",
                info.base_url
            ),
            RelayMode::ImagesEdits => format!(
                "{}/api/v1/services/aigc/multimodal-generation/generation",
                info.base_url
            ),
            RelayMode::Completions => {
                format!("{}/compatible-mode/v1/completions", info.base_url)
            }
            _ => format!("{}/compatible-mode/v1/chat/completions", info.base_url),
        })
    }

    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError> {
        header_set(headers, "Authorization", format!("Bearer {}", info.api_key));
        if info.is_stream {
            header_set(headers, "X-DashScope-SSE", "enable");
        }
        if info.mode == RelayMode::ImagesGenerations {
            header_set(headers, "X-DashScope-Async", "enable");
        }
        Ok(())
    }

    fn convert_openai(
        &self,
        info: &mut RelayInfo,
        mut req: ChatCompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        if req.is_stream() {
            info.is_stream = true;
        }
        // Thinking models only accept enable_thinking=true, and only when
        // streaming; force both. Non-stream calls must send false.
        if req.model.contains("thinking") {
            req.extra
                .insert("enable_thinking".to_string(), Value::Bool(true));
            req.stream = Some(true);
            info.is_stream = true;
        } else if !info.is_stream {
            req.extra
                .insert("enable_thinking".to_string(), Value::Bool(false));
        }
        ConvertedBody::json(&req)
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
        let mut parameters = serde_json::Map::new();
        if let Some(n) = req.n {
            parameters.insert("n".into(), json!(n));
        }
        if let Some(size) = &req.size {
            // DashScope sizes use `*` where the OpenAI dialect uses `x`.
            parameters.insert("size".into(), json!(size.replace('x', "*")));
        }
        ConvertedBody::json(&json!({
            "model": req.model,
            "input": {"prompt": req.prompt},
            "parameters": parameters,
        }))
    }

    fn convert_rerank(
        &self,
        _mode: RelayMode,
        req: RerankRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&json!({
            "model": req.model,
            "input": {"query": req.query, "documents": req.documents},
            "parameters": {"top_n": req.top_n, "return_documents": true},
        }))
    }

    fn respond(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
    ) -> Result<AdapterResponse, RelayError> {
        match info.mode {
            // Native DashScope envelopes pass through buffered; billing for
            // these is per call plus the counted prompt.
            RelayMode::ImagesGenerations | RelayMode::ImagesEdits | RelayMode::Rerank => {
                let status = resp.status;
                match resp.body {
                    UpstreamBody::Bytes(body) => {
                        if !(200..300).contains(&status) {
                            return Err(RelayError::channel_response(
                                status,
                                crate::common::upstream_error_message(&body),
                            ));
                        }
                        Ok(AdapterResponse {
                            payload: RelayPayload::Buffered {
                                status,
                                headers: passthrough_headers(&resp.headers),
                                body,
                            },
                            usage: UsageHandle::Immediate(Usage::new(info.prompt_tokens, 0)),
                        })
                    }
                    UpstreamBody::Stream(_) => Err(RelayError::internal(
                        "dashscope task endpoint answered with a stream",
                    )),
                }
            }
            _ => respond_openai_style(info, resp),
        }
    }
}
