use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map, Value};

use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::gemini::{EmbedContentRequest, GenerateContentRequest};
use tollgate_protocol::openai::{
    AudioRequest, ChatCompletionRequest, CompletionRequest, EmbeddingRequest, ImageRequest,
    RerankRequest, ResponsesRequest,
};
use tollgate_protocol::task::TaskSubmitRequest;

/// The inbound API shape the client is speaking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayFormat {
    OpenAI,
    Claude,
    Gemini,
    OpenAIRealtime,
    Task,
    MjProxy,
}

/// The semantic operation category, independent of dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
    ImagesEdits,
    AudioSpeech,
    AudioTranslation,
    AudioTranscription,
    Rerank,
    Responses,
    Realtime,
    TaskSubmit,
    TaskFetch,
}

impl RelayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayMode::ChatCompletions => "chat",
            RelayMode::Completions => "completions",
            RelayMode::Embeddings => "embeddings",
            RelayMode::ImagesGenerations => "images-generations",
            RelayMode::ImagesEdits => "images-edits",
            RelayMode::AudioSpeech => "audio-speech",
            RelayMode::AudioTranslation => "audio-translation",
            RelayMode::AudioTranscription => "audio-transcription",
            RelayMode::Rerank => "rerank",
            RelayMode::Responses => "responses",
            RelayMode::Realtime => "realtime",
            RelayMode::TaskSubmit => "task-submit",
            RelayMode::TaskFetch => "task-fetch",
        }
    }
}

/// Upstream provider family a channel points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelType {
    OpenAI = 1,
    Anthropic = 2,
    Gemini = 3,
    Ali = 4,
    Zhipu = 5,
    MjProxy = 6,
    Suno = 7,
}

impl ChannelType {
    pub fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            1 => ChannelType::OpenAI,
            2 => ChannelType::Anthropic,
            3 => ChannelType::Gemini,
            4 => ChannelType::Ali,
            5 => ChannelType::Zhipu,
            6 => ChannelType::MjProxy,
            7 => ChannelType::Suno,
            _ => return None,
        })
    }
}

/// Parsed request payload in the caller's dialect.
#[derive(Debug, Clone)]
pub enum ParsedRequest {
    Chat(ChatCompletionRequest),
    Completion(CompletionRequest),
    Embedding(EmbeddingRequest),
    Image(ImageRequest),
    Audio(AudioRequest),
    Rerank(RerankRequest),
    Responses(ResponsesRequest),
    Claude(ClaudeMessagesRequest),
    GeminiGenerate(GenerateContentRequest),
    GeminiEmbed(EmbedContentRequest),
    Task(TaskSubmitRequest),
    /// Realtime has no body; task fetches carry opaque bodies.
    Raw,
}

/// Metadata used for token counting and sensitive-word screening.
#[derive(Debug, Clone, Default)]
pub struct TokenCountMeta {
    pub combined_text: String,
    pub image_count: usize,
    pub tool_text: String,
}

/// Canonical request envelope: the parsed payload plus the raw bytes, which
/// are retained so every retry attempt re-sends identical input.
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub parsed: ParsedRequest,
    pub raw_body: Bytes,
    pub content_type: String,
}

impl RelayEnvelope {
    pub fn token_count_meta(&self) -> TokenCountMeta {
        let mut meta = TokenCountMeta::default();
        match &self.parsed {
            ParsedRequest::Chat(req) => {
                let mut texts = Vec::new();
                for message in &req.messages {
                    texts.push(message.content.plain_text());
                    meta.image_count += message.content.image_count();
                }
                meta.combined_text = texts.join("\n");
                if let Some(tools) = &req.tools {
                    meta.tool_text = tools
                        .iter()
                        .map(|tool| tool.to_string())
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
            ParsedRequest::Completion(req) => {
                meta.combined_text = match &req.prompt {
                    Value::String(text) => text.clone(),
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("\n"),
                    _ => String::new(),
                };
            }
            ParsedRequest::Embedding(req) => meta.combined_text = req.input_text(),
            ParsedRequest::Image(req) => meta.combined_text = req.prompt.clone(),
            ParsedRequest::Audio(req) => meta.combined_text = req.input.clone(),
            ParsedRequest::Rerank(req) => {
                meta.combined_text = format!("{}\n{}", req.query, req.document_text());
            }
            ParsedRequest::Responses(req) => {
                meta.combined_text = match &req.input {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                };
            }
            ParsedRequest::Claude(req) => {
                let mut texts = vec![req.system_text()];
                for message in &req.messages {
                    texts.push(message.plain_text());
                    meta.image_count += message.image_count();
                }
                meta.combined_text = texts.join("\n");
                if let Some(tools) = &req.tools {
                    meta.tool_text = tools
                        .iter()
                        .map(|tool| tool.to_string())
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
            ParsedRequest::GeminiGenerate(req) => {
                let mut texts = Vec::new();
                if let Some(system) = &req.system_instruction {
                    texts.push(system.plain_text());
                }
                for content in &req.contents {
                    texts.push(content.plain_text());
                    meta.image_count += content.image_count();
                }
                meta.combined_text = texts.join("\n");
            }
            ParsedRequest::GeminiEmbed(req) => {
                if let Some(content) = &req.content {
                    meta.combined_text = content.plain_text();
                }
            }
            ParsedRequest::Task(req) => {
                meta.combined_text = req.prompt.clone().unwrap_or_default();
            }
            ParsedRequest::Raw => {}
        }
        meta
    }

    /// The model the caller asked for, when the dialect carries one in the
    /// body. Gemini models arrive in the URL path and are set by the router.
    pub fn body_model(&self) -> Option<&str> {
        match &self.parsed {
            ParsedRequest::Chat(req) => Some(&req.model),
            ParsedRequest::Completion(req) => Some(&req.model),
            ParsedRequest::Embedding(req) => Some(&req.model),
            ParsedRequest::Image(req) => Some(&req.model),
            ParsedRequest::Audio(req) => Some(&req.model),
            ParsedRequest::Rerank(req) => Some(&req.model),
            ParsedRequest::Responses(req) => Some(&req.model),
            ParsedRequest::Claude(req) => Some(&req.model),
            ParsedRequest::Task(req) => req.model.as_deref(),
            _ => None,
        }
    }

    pub fn is_stream(&self) -> bool {
        match &self.parsed {
            ParsedRequest::Chat(req) => req.is_stream(),
            ParsedRequest::Completion(req) => req.stream.unwrap_or(false),
            ParsedRequest::Claude(req) => req.is_stream(),
            ParsedRequest::Responses(req) => req.stream.unwrap_or(false),
            _ => false,
        }
    }
}

/// Per-request ledger built at pipeline entry and mutated through the
/// attempts. One value, passed by reference; middleware fills the identity
/// and channel-pin prefix before the pipeline starts.
#[derive(Debug, Clone)]
pub struct RelayInfo {
    pub request_id: String,
    pub user_id: i64,
    pub token_id: i64,
    pub group: String,
    /// Model name as the caller sent it.
    pub original_model: String,
    /// Model name after the channel's alias mapping.
    pub upstream_model: String,
    pub format: RelayFormat,
    pub mode: RelayMode,
    /// Inbound path, used verbatim by the task dialects whose upstream mirrors
    /// the client surface.
    pub request_url_path: String,
    pub is_stream: bool,
    pub base_url: String,
    pub api_key: String,
    pub channel_id: i64,
    pub channel_type: ChannelType,
    pub channel_name: String,
    pub is_multi_key: bool,
    pub multi_key_index: Option<usize>,
    /// The caller's token forces this exact channel; failures never retry.
    pub specific_channel: bool,
    /// Copied from the channel row at selection time; gates auto-disable.
    pub auto_ban: bool,
    pub param_override: Map<String, Value>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    /// Non-zero iff pre-consumption succeeded; zeroed at settlement.
    pub final_pre_consumed_quota: i64,
    pub start_time: Instant,
}

impl RelayInfo {
    pub fn new(
        request_id: String,
        format: RelayFormat,
        mode: RelayMode,
        original_model: String,
    ) -> Self {
        Self {
            request_id,
            user_id: 0,
            token_id: 0,
            group: "default".to_string(),
            upstream_model: original_model.clone(),
            original_model,
            format,
            mode,
            request_url_path: String::new(),
            is_stream: false,
            base_url: String::new(),
            api_key: String::new(),
            channel_id: 0,
            channel_type: ChannelType::OpenAI,
            channel_name: String::new(),
            is_multi_key: false,
            multi_key_index: None,
            specific_channel: false,
            auto_ban: false,
            param_override: Map::new(),
            prompt_tokens: 0,
            completion_tokens: 0,
            final_pre_consumed_quota: 0,
            start_time: Instant::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_meta_combines_text_and_counts_images() {
        let parsed: ChatCompletionRequest = serde_json::from_value(serde_json::json!({
            "model": "gpt-x",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [
                    {"type": "text", "text": "what is in"},
                    {"type": "image_url", "image_url": {"url": "https://img/x.png"}},
                ]},
            ],
        }))
        .unwrap();
        let envelope = RelayEnvelope {
            parsed: ParsedRequest::Chat(parsed),
            raw_body: Bytes::new(),
            content_type: "application/json".into(),
        };
        let meta = envelope.token_count_meta();
        assert_eq!(meta.combined_text, "be brief\nwhat is in");
        assert_eq!(meta.image_count, 1);
        assert_eq!(envelope.body_model(), Some("gpt-x"));
        assert!(!envelope.is_stream());
    }
}
