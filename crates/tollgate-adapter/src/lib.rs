//! Provider adapters and the pieces of the relay they share: the error
//! taxonomy, the per-request ledger, pricing, token counting, the upstream
//! HTTP client, and streamed-response plumbing.
//!
//! Adapters convert canonical dialect requests into provider wire format and
//! responses back; the pipeline in `tollgate-relay` only ever talks to the
//! [`ChannelAdapter`] capability surface.

pub mod adapter;
pub mod common;
pub mod count;
pub mod error;
pub mod info;
pub mod price;
pub mod stream;
pub mod upstream;

mod ali;
mod claude;
mod gemini;
mod mjproxy;
mod openai;
mod suno;
mod zhipu;

pub use adapter::{convert_request, ChannelAdapter, ConvertedBody};
pub use ali::AliAdapter;
pub use claude::ClaudeAdapter;
pub use error::{ChannelError, ErrorKind, RelayError};
pub use gemini::GeminiAdapter;
pub use info::{
    ChannelType, ParsedRequest, RelayEnvelope, RelayFormat, RelayInfo, RelayMode, TokenCountMeta,
};
pub use mjproxy::MjProxyAdapter;
pub use openai::OpenAiAdapter;
pub use price::{ModelPrice, PriceData, PriceTable};
pub use stream::{
    relay_sse_stream, AdapterResponse, RelayPayload, StreamOutcome, StreamUsageProbe, UsageHandle,
};
pub use suno::SunoAdapter;
pub use upstream::{
    header_get, header_set, Headers, HttpMethod, HttpUpstreamClient, TransportError,
    TransportErrorKind, UpstreamBody, UpstreamClient, UpstreamClientConfig, UpstreamHttpRequest,
    UpstreamHttpResponse,
};
pub use zhipu::ZhipuAdapter;

use std::sync::Arc;

/// Resolve the adapter for a channel's provider family.
pub fn adapter_for(channel_type: ChannelType) -> Arc<dyn ChannelAdapter> {
    match channel_type {
        ChannelType::OpenAI => Arc::new(OpenAiAdapter),
        ChannelType::Anthropic => Arc::new(ClaudeAdapter),
        ChannelType::Gemini => Arc::new(GeminiAdapter),
        ChannelType::Ali => Arc::new(AliAdapter),
        ChannelType::Zhipu => Arc::new(ZhipuAdapter),
        ChannelType::MjProxy => Arc::new(MjProxyAdapter),
        ChannelType::Suno => Arc::new(SunoAdapter),
    }
}
