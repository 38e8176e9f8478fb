use bytes::Bytes;

use tollgate_rewrite::apply_param_override;

use crate::adapter::{ChannelAdapter, ConvertedBody};
use crate::error::{ErrorKind, RelayError};
use crate::info::RelayInfo;
use crate::upstream::{
    header_set, Headers, HttpMethod, TransportError, TransportErrorKind, UpstreamClient,
    UpstreamHttpRequest, UpstreamHttpResponse,
};

/// Shared upstream dispatch used by every adapter's default `execute`.
///
/// The rewrite program runs here, per attempt, so the bytes that leave the
/// process are deterministic given the converted body. Multipart and binary
/// bodies skip rewriting.
pub async fn do_api_request<A: ChannelAdapter + ?Sized>(
    adapter: &A,
    client: &dyn UpstreamClient,
    info: &RelayInfo,
    body: ConvertedBody,
) -> Result<UpstreamHttpResponse, RelayError> {
    let bytes = if body.content_type == "application/json" && !info.param_override.is_empty() {
        Bytes::from(
            apply_param_override(&body.bytes, &info.param_override).map_err(|err| {
                RelayError::new(
                    ErrorKind::Internal,
                    format!("param override failed: {err}"),
                )
            })?,
        )
    } else {
        body.bytes
    };

    let mut headers: Headers = Vec::new();
    header_set(&mut headers, "Content-Type", body.content_type.clone());
    header_set(&mut headers, "Accept", "application/json");
    if info.is_stream {
        header_set(&mut headers, "Accept", "text/event-stream");
    }
    adapter.headers(info, &mut headers)?;

    let req = UpstreamHttpRequest {
        method: HttpMethod::Post,
        url: adapter.url(info)?,
        headers,
        body: Some(bytes),
        is_stream: info.is_stream,
    };

    client
        .send(req)
        .await
        .map_err(|failure| transport_to_relay_error(&failure))
}

/// Transport failures are channel faults: retryable on another channel, with
/// timeouts mapped onto the non-retryable gateway-timeout status.
pub fn transport_to_relay_error(failure: &TransportError) -> RelayError {
    match failure.kind {
        TransportErrorKind::Timeout => RelayError::channel_response(504, &failure.message),
        _ => RelayError::channel_response(502, &failure.message).with_channel_error(),
    }
}

/// Pull a human-readable message out of an upstream error body, falling back
/// to the raw text.
pub fn upstream_error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        for pointer in ["/error/message", "/message", "/error", "/detail"] {
            if let Some(message) = value.pointer(pointer).and_then(|v| v.as_str()) {
                return message.to_string();
            }
        }
    }
    let text = text.trim();
    if text.is_empty() {
        "upstream returned an empty error body".to_string()
    } else {
        text.chars().take(512).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_message_extraction() {
        assert_eq!(
            upstream_error_message(br#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(
            upstream_error_message(br#"{"message":"nope"}"#),
            "nope"
        );
        assert_eq!(upstream_error_message(b"plain failure"), "plain failure");
        assert_eq!(
            upstream_error_message(b""),
            "upstream returned an empty error body"
        );
    }

    #[test]
    fn timeout_maps_to_gateway_timeout_status() {
        let err = transport_to_relay_error(&TransportError {
            kind: TransportErrorKind::Timeout,
            message: "deadline exceeded".into(),
        });
        assert_eq!(err.status, 504);
        assert!(!err.channel_error);

        let err = transport_to_relay_error(&TransportError {
            kind: TransportErrorKind::Connect,
            message: "refused".into(),
        });
        assert_eq!(err.status, 502);
        assert!(err.channel_error);
    }
}
