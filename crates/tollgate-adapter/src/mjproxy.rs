use tollgate_protocol::openai::Usage;
use tollgate_protocol::task::TaskSubmitRequest;

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::RelayError;
use crate::info::{RelayInfo, RelayMode};
use crate::openai::passthrough_headers;
use crate::stream::{AdapterResponse, RelayPayload, UsageHandle};
use crate::upstream::{header_set, Headers, UpstreamBody, UpstreamHttpResponse};

/// Midjourney-proxy deployments. The upstream mirrors the client surface, so
/// submit and fetch URLs reuse the inbound path; billing is per call.
#[derive(Debug, Default)]
pub struct MjProxyAdapter;

impl ChannelAdapter for MjProxyAdapter {
    fn name(&self) -> &'static str {
        "midjourney-proxy"
    }

    fn models(&self) -> Vec<String> {
        vec!["mj_imagine".into(), "mj_variation".into(), "mj_upscale".into()]
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
        header_set(headers, "mj-api-secret", info.api_key.clone());
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

/// Shared buffered passthrough for the task dialects.
pub(crate) fn respond_task_style(
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
            "task endpoint answered with a stream",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::RelayFormat;

    #[test]
    fn submit_url_mirrors_inbound_path() {
        let adapter = MjProxyAdapter;
        let mut info = RelayInfo::new(
            "r".into(),
            RelayFormat::MjProxy,
            RelayMode::TaskSubmit,
            "mj_imagine".into(),
        );
        info.base_url = "https://mj.example".into();
        info.request_url_path = "/mj/submit/imagine".into();
        assert_eq!(
            adapter.url(&info).unwrap(),
            "https://mj.example/mj/submit/imagine"
        );
        info.mode = RelayMode::ChatCompletions;
        assert!(adapter.url(&info).is_err());
    }
}
