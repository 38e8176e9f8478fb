//! Realtime dialect: WebSocket upgrade on the client side, bridged to the
//! upstream socket opened by the relay core.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as UpstreamMessage;
use tracing::{info, warn};

use tollgate_adapter::{ErrorKind, RelayError, RelayFormat, RelayInfo, RelayMode};
use tollgate_protocol::openai::Usage;
use tollgate_relay::realtime::establish_upstream;
use tollgate_relay::{
    apply_selection, select_channel, AppState, AuthContext, SettleContext, SideTask,
};

use crate::auth::RequestId;
use crate::render::error_response;

/// `GET /v1/realtime?model=...` with `Upgrade: websocket`. A request without
/// the upgrade handshake gets the realtime-framed 400 without touching quota.
pub async fn realtime(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Query(query): Query<HashMap<String, String>>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(ws) = ws else {
        let err = RelayError::new(
            ErrorKind::InvalidRequest,
            "realtime requires a websocket upgrade",
        );
        return error_response(RelayFormat::OpenAIRealtime, &request_id, &err);
    };
    let model = query.get("model").cloned().unwrap_or_default();
    if model.is_empty() {
        let err = RelayError::new(ErrorKind::InvalidRequest, "model query parameter is required");
        return error_response(RelayFormat::OpenAIRealtime, &request_id, &err);
    }

    ws.protocols(["realtime"])
        .on_upgrade(move |socket| bridge(state, auth, request_id, model, socket))
}

async fn bridge(
    state: Arc<AppState>,
    auth: AuthContext,
    request_id: String,
    model: String,
    mut client: WebSocket,
) {
    let mut info = RelayInfo::new(
        request_id.clone(),
        RelayFormat::OpenAIRealtime,
        RelayMode::Realtime,
        model,
    );
    info.user_id = auth.user_id;
    info.token_id = auth.token_id;
    info.group = auth.group;
    info.is_stream = true;

    if let Err(err) = prepare(&state, &mut info).await {
        send_error(&mut client, &request_id, &err).await;
        state.accountant.refund(&mut info).await;
        return;
    }

    let upstream = match establish_upstream(&state, &mut info).await {
        Ok(socket) => socket,
        Err(err) => {
            send_error(&mut client, &request_id, &err).await;
            state.accountant.refund(&mut info).await;
            return;
        }
    };
    info!(
        request_id = %request_id,
        channel = info.channel_id,
        model = %info.upstream_model,
        "realtime session established"
    );

    let (mut upstream_tx, mut upstream_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client.split();
    // Frames flow from here on: any further failure is terminal for the
    // session, never a retry.
    loop {
        tokio::select! {
            frame = client_rx.next() => {
                match frame {
                    Some(Ok(message)) => {
                        let Some(forward) = client_to_upstream(message) else {
                            break;
                        };
                        if upstream_tx.send(forward).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
            frame = upstream_rx.next() => {
                match frame {
                    Some(Ok(message)) => {
                        let Some(forward) = upstream_to_client(message) else {
                            break;
                        };
                        if client_tx.send(forward).await.is_err() {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    settle(&state, &mut info).await;
    let _ = client_tx
        .send(ClientMessage::Close(Some(CloseFrame {
            code: 1000,
            reason: "session closed".into(),
        })))
        .await;
}

/// Price and hold before the upstream handshake. Realtime requests carry no
/// countable prompt, so the hold is the completion estimate plus surcharge.
async fn prepare(state: &Arc<AppState>, info: &mut RelayInfo) -> Result<(), RelayError> {
    let selected = select_channel(&state.cache, &info.group, &info.original_model, &[])?;
    apply_selection(info, &selected);
    let price = state.prices.load().price_data(info, 0, None)?;
    state
        .accountant
        .pre_consume(info, price.should_pre_consumed_quota)
        .await?;
    Ok(())
}

/// Frame counts for realtime usage are not observable at this layer, so the
/// session settles at the per-call price and the rest of the hold returns.
async fn settle(state: &Arc<AppState>, info: &mut RelayInfo) {
    let Ok(price) = state.prices.load().price_data(info, 0, None) else {
        state.accountant.refund(info).await;
        return;
    };
    let ctx = SettleContext {
        request_id: info.request_id.clone(),
        user_id: info.user_id,
        token_id: info.token_id,
        channel_id: info.channel_id,
        model_name: info.original_model.clone(),
        group: info.group.clone(),
        is_stream: true,
        pre_consumed: info.final_pre_consumed_quota,
        price,
    };
    info.final_pre_consumed_quota = 0;
    state
        .sink
        .post_wait(SideTask::Settle {
            ctx,
            usage: Usage::new(0, 0),
        })
        .await;
}

async fn send_error(client: &mut WebSocket, request_id: &str, err: &RelayError) {
    let mut event = err.to_realtime_event();
    event.error.message =
        tollgate_common::message_with_request_id(&event.error.message, request_id);
    match serde_json::to_string(&event) {
        Ok(text) => {
            if client.send(ClientMessage::Text(text.into())).await.is_err() {
                warn!(request_id = %request_id, "client gone before realtime error delivery");
            }
        }
        Err(err) => warn!(request_id = %request_id, error = %err, "realtime error encode failed"),
    }
}

fn client_to_upstream(message: ClientMessage) -> Option<UpstreamMessage> {
    match message {
        ClientMessage::Text(text) => Some(UpstreamMessage::Text(text.to_string().into())),
        ClientMessage::Binary(data) => Some(UpstreamMessage::Binary(data)),
        ClientMessage::Ping(data) => Some(UpstreamMessage::Ping(data)),
        ClientMessage::Pong(data) => Some(UpstreamMessage::Pong(data)),
        ClientMessage::Close(_) => None,
    }
}

fn upstream_to_client(message: UpstreamMessage) -> Option<ClientMessage> {
    match message {
        UpstreamMessage::Text(text) => Some(ClientMessage::Text(text.to_string().into())),
        UpstreamMessage::Binary(data) => Some(ClientMessage::Binary(data)),
        UpstreamMessage::Ping(data) => Some(ClientMessage::Ping(data)),
        UpstreamMessage::Pong(data) => Some(ClientMessage::Pong(data)),
        UpstreamMessage::Close(_) => None,
        UpstreamMessage::Frame(_) => None,
    }
}
