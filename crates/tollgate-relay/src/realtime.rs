//! Upstream connection establishment for the Realtime dialect.
//!
//! The retry discipline matches the HTTP pipeline but ends at the handshake:
//! once a socket is open and frames flow, failures are terminal.

use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::warn;

use tollgate_adapter::{ErrorKind, RelayError, RelayInfo};

use crate::channel_error::{process_channel_error, ErrorLogContext};
use crate::pipeline::should_retry;
use crate::select::{apply_selection, select_channel};
use crate::state::AppState;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn websocket_url(info: &RelayInfo) -> String {
    let base = info
        .base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1);
    format!("{base}/v1/realtime?model={}", info.upstream_model)
}

/// Open the upstream realtime socket under the channel/retry discipline.
pub async fn establish_upstream(
    state: &Arc<AppState>,
    info: &mut RelayInfo,
) -> Result<UpstreamSocket, RelayError> {
    let global = state.global.load();
    let retry_times = global.retry_times;
    let mut tried: Vec<i64> = Vec::new();
    let mut last_err = RelayError::internal("realtime attempts exhausted");

    for attempt in 0..=retry_times {
        if attempt == 0 && info.channel_id != 0 {
            // Keep the channel pinned by the routing middleware.
        } else {
            match select_channel(&state.cache, &info.group, &info.original_model, &tried) {
                Ok(selected) => apply_selection(info, &selected),
                Err(err) => {
                    last_err = err;
                    break;
                }
            }
        }
        tried.push(info.channel_id);

        match connect_once(info).await {
            Ok(socket) => return Ok(socket),
            Err(err) => {
                warn!(
                    request_id = %info.request_id,
                    channel = info.channel_id,
                    error = %err.message,
                    "realtime upstream connect failed"
                );
                process_channel_error(
                    &state.sink,
                    global.error_log_enabled,
                    tollgate_adapter::ChannelError {
                        channel_id: info.channel_id,
                        channel_type: info.channel_type as i32,
                        channel_name: info.channel_name.clone(),
                        is_multi_key: info.is_multi_key,
                        used_key: info.api_key.clone(),
                        auto_ban: info.auto_ban,
                    },
                    &err,
                    ErrorLogContext {
                        user_id: info.user_id,
                        token_id: info.token_id,
                        model_name: info.original_model.clone(),
                        group: info.group.clone(),
                        multi_key_index: info.multi_key_index.map(|index| index as i32),
                        use_channel: tried.clone(),
                    },
                );
                let remaining = retry_times as i64 - attempt as i64;
                let retry = should_retry(&err, remaining, info.specific_channel);
                last_err = err;
                if !retry {
                    break;
                }
            }
        }
    }
    Err(last_err)
}

async fn connect_once(info: &RelayInfo) -> Result<UpstreamSocket, RelayError> {
    let url = websocket_url(info);
    let mut request = url
        .into_client_request()
        .map_err(|err| RelayError::new(ErrorKind::GenRelayInfoFailed, err).with_skip_retry())?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        format!("Bearer {}", info.api_key)
            .parse()
            .map_err(|_| RelayError::internal("credential is not a valid header value"))?,
    );
    headers.insert(
        "OpenAI-Beta",
        "realtime=v1"
            .parse()
            .map_err(|_| RelayError::internal("invalid beta header"))?,
    );

    let (socket, _response) = connect_async(request)
        .await
        .map_err(|err| RelayError::channel_response(502, err))?;
    Ok(socket)
}
