use tollgate_protocol::task::TaskSubmitRequest;

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::RelayError;
use crate::info::{RelayInfo, RelayMode};
use crate::mjproxy::respond_task_style;
use crate::stream::AdapterResponse;
use crate::upstream::{header_set, Headers, UpstreamHttpResponse};

/// Suno-style task upstreams (music and video generation queues).
#[derive(Debug, Default)]
pub struct SunoAdapter;

impl ChannelAdapter for SunoAdapter {
    fn name(&self) -> &'static str {
        "suno"
    }

    fn models(&self) -> Vec<String> {
        vec!["suno_music".into(), "suno_lyrics".into()]
    }

    fn url(&self, info: &RelayInfo) -> Result<String, RelayError> {
        match info.mode {
            RelayMode::TaskSubmit | RelayMode::TaskFetch => {
                Ok(format!("{}{}", info.base_url, info.request_url_path))
            }
            other => Err(RelayError::unsupported(other.as_str())),
        }
    }

    fn headers(&self, info: &RelayInfo, headers: &mut Headers) -> Result<(), RelayError> {
        header_set(headers, "Authorization", format!("Bearer {}", info.api_key));
        Ok(())
    }

    fn convert_task(
        &self,
        _info: &mut RelayInfo,
        req: TaskSubmitRequest,
    ) -> Result<ConvertedBody, RelayError> {
        ConvertedBody::json(&req)
    }

    fn respond(
        &self,
        info: &mut RelayInfo,
        resp: UpstreamHttpResponse,
    ) -> Result<AdapterResponse, RelayError> {
        respond_task_style(info, resp)
    }
}
