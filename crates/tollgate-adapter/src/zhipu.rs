use serde_json::Value;

use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::openai::{ChatCompletionRequest, EmbeddingRequest};

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::RelayError;
use crate::info::{RelayFormat, RelayInfo, RelayMode};
use crate::openai::respond_openai_style;
use crate::stream::AdapterResponse;
use crate::upstream::{header_set, Headers, UpstreamHttpResponse};

/// Zhipu GLM open platform (paas v4 surface).
#[derive(Debug, Default)]
pub struct ZhipuAdapter;

impl ChannelAdapter for ZhipuAdapter {
    fn name(&self) -> &'static str {
        "zhipu"
    }

    fn models(&self) -> Vec<String> {
        vec!["glm-4".into(), "glm-4v".into(), "embedding-3".into()]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        if info.format == RelayFormat::Claude {
            return Ok(format!("{}/api/anthropic/v1/messages", info.base_url));
        }
        Ok(match info.mode {
            RelayMode::Embeddings => format!("{}/api/paas/v4/embeddings", info.base_url),
            _ => format!("{}/api/paas/v4/chat/completions", info.base_url),
        })
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
        }
        // The v4 surface rejects top_p at the closed interval bounds.
        if let Some(top_p) = req.extra.get("top_p").and_then(Value::as_f64) {
            if top_p >= 1.0 {
                req.extra
                    .insert("top_p".to_string(), serde_json::json!(0.99));
            }
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

    fn respond(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
    ) -> Result<AdapterResponse, RelayError> {
        respond_openai_style(info, resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn top_p_is_clamped_below_one() {
        let adapter = ZhipuAdapter;
        let mut info = RelayInfo::new(
            "r".into(),
            RelayFormat::OpenAI,
            RelayMode::ChatCompletions,
            "glm-4".into(),
        );
        let req: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "glm-4",
            "messages": [{"role": "user", "content": "hi"}],
            "top_p": 1.0,
        }))
        .unwrap();
        let body = adapter.convert_openai(&mut info, req).unwrap();
        let value: Value = serde_json::from_slice(&body.bytes).unwrap();
        assert_eq!(value["top_p"], serde_json::json!(0.99));
    }

    #[test]
    fn urls_use_paas_v4() {
        let adapter = ZhipuAdapter;
        let mut info = RelayInfo::new(
            "r".into(),
            RelayFormat::OpenAI,
            RelayMode::ChatCompletions,
            "glm-4".into(),
        );
        info.base_url = "https://zhipu.example".into();
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://zhipu.example/api/paas/v4/chat/completions"
        );
        info.mode = RelayMode::Embeddings;
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://zhipu.example/api/paas/v4/embeddings"
        );
        info.format = RelayFormat::Claude;
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://zhipu.example/api/anthropic/v1/messages"
        );
    }
}
