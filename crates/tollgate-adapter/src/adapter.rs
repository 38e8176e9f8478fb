use async_trait::async_trait;
use bytes::Bytes;

use tollgate_protocol::claude::ClaudeMessagesRequest;
use tollgate_protocol::gemini::{EmbedContentRequest, GenerateContentRequest};
use tollgate_protocol::openai::{
    AudioRequest, ChatCompletionRequest, CompletionRequest, EmbeddingRequest, ImageRequest,
    RerankRequest, ResponsesRequest,
};
use tollgate_protocol::task::TaskSubmitRequest;

use crate::error::RelayError;
use crate::info::{ParsedRequest, RelayEnvelope, RelayInfo, RelayMode};
use crate::stream::AdapterResponse;
use crate::upstream::{Headers, UpstreamClient, UpstreamHttpResponse};

/// Body produced by a conversion, ready for upstream dispatch.
#[derive(Debug, Clone)]
pub struct ConvertedBody {
    pub bytes: Bytes,
    pub content_type: String,
}

impl ConvertedBody {
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, RelayError> {
        let bytes = serde_json::to_vec(value).map_err(RelayError::internal)?;
        Ok(Self {
            bytes: Bytes::from(bytes),
            content_type: "application/json".to_string(),
        })
    }

    pub fn raw(bytes: Bytes, content_type: impl Into<String>) -> Self {
        Self {
            bytes,
            content_type: content_type.into(),
        }
    }
}

/// Capability surface of one upstream provider family.
///
/// Conversions an upstream cannot express keep the default implementation and
/// surface as a client-visible "unsupported operation" error. Conversion
/// methods take the request by value: they may rewrite it (model alias,
/// forced streaming) before serializing the provider-native body.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Capability advertisement for the models listing surface.
    fn models(&self) -> Vec<String>;

    /// Per-request setup hook.
    fn init(&self, _info: &mut RelayInfo) {}

    /// Upstream URL for the (dialect, mode) carried by the request.
    fn url(&self, info: &RelayInfo) -> Result<String, RelayError>;

    /// Credential and vendor-specific headers.
    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError>;

    fn convert_openai(
        &self,
        _info: &mut RelayInfo,
        _req: ChatCompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("chat_completions"))
    }

    fn convert_completion(
        &self,
        _info: &mut RelayInfo,
        _req: CompletionRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("completions"))
    }

    fn convert_claude(
        &self,
        _info: &mut RelayInfo,
        _req: ClaudeMessagesRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("claude_messages"))
    }

    fn convert_gemini(
        &self,
        _info: &mut RelayInfo,
        _req: GenerateContentRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("gemini_generate_content"))
    }

    fn convert_gemini_embed(
        &self,
        _info: &mut RelayInfo,
        _req: EmbedContentRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("gemini_embed_content"))
    }

    /// Generation vs edit is distinguished by `info.mode`; edits may arrive
    /// as multipart and are re-framed by the adapter.
    fn convert_image(
        &self,
        _info: &mut RelayInfo,
        _req: ImageRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("images"))
    }

    fn convert_embedding(
        &self,
        _info: &mut RelayInfo,
        _req: EmbeddingRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("embeddings"))
    }

    fn convert_rerank(
        &self,
        _mode: RelayMode,
        _req: RerankRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("rerank"))
    }

    fn convert_audio(
        &self,
        _info: &mut RelayInfo,
        _req: AudioRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("audio"))
    }

    fn convert_responses(
        &self,
        _info: &mut RelayInfo,
        _req: ResponsesRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("responses"))
    }

    fn convert_task(
        &self,
        _info: &mut RelayInfo,
        _req: TaskSubmitRequest,
    ) -> Result<ConvertedBody, RelayError> {
        Err(RelayError::unsupported("task_submit"))
    }

    /// Centralised HTTP dispatch: applies the channel's rewrite program to
    /// JSON bodies, sets headers, and sends.
    async fn execute(
        &self,
        client: &dyn UpstreamClient,
        info: &RelayInfo,
        body: ConvertedBody,
    ) -> Result<UpstreamHttpResponse, RelayError> {
        crate::common::do_api_request(self, client, info, body).await
    }

    /// Turn the upstream response into the caller-facing payload plus a
    /// usage record (immediate for buffered bodies, deferred for streams).
    fn respond(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
    ) -> Result<AdapterResponse, RelayError>;
}

/// Route the parsed envelope to the adapter conversion matching its dialect
/// and mode. `info.is_stream` may be mutated by the conversion.
pub fn convert_request(
    adapter: &dyn ChannelAdapter,
    info: &mut RelayInfo,
    envelope: &RelayEnvelope,
) -> Result<ConvertedBody, RelayError> {
    match envelope.parsed.clone() {
        ParsedRequest::Chat(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_openai(info, req)
        }
        ParsedRequest::Completion(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_completion(info, req)
        }
        ParsedRequest::Embedding(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_embedding(info, req)
        }
        ParsedRequest::Image(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_image(info, req)
        }
        ParsedRequest::Audio(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_audio(info, req)
        }
        ParsedRequest::Rerank(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_rerank(info.mode, req)
        }
        ParsedRequest::Responses(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_responses(info, req)
        }
        ParsedRequest::Claude(mut req) => {
            req.model = info.upstream_model.clone();
            adapter.convert_claude(info, req)
        }
        ParsedRequest::GeminiGenerate(req) => adapter.convert_gemini(info, req),
        ParsedRequest::GeminiEmbed(req) => adapter.convert_gemini_embed(info, req),
        ParsedRequest::Task(mut req) => {
            if req.model.is_some() {
                req.model = Some(info.upstream_model.clone());
            }
            adapter.convert_task(info, req)
        }
        ParsedRequest::Raw => Ok(ConvertedBody::raw(
            envelope.raw_body.clone(),
            envelope.content_type.clone(),
        )),
    }
}
