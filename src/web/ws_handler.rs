use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt, future};
use tracing::{info, warn};

use crate::engine::connection::{ConnectionHandler, HandshakeError, InboundError};
use crate::engine::events::{InboundMessage, Message};

use super::app_state::AppState;

/// Close frame reasons are capped at 123 bytes by the protocol.
const MAX_CLOSE_REASON: usize = 123;

pub async fn ws_upgrade(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handler = state.handler.clone();
    ws.on_upgrade(move |socket| handle_ws_connection(socket, handler))
}

async fn handle_ws_connection(socket: WebSocket, handler: ConnectionHandler) {
    let (mut ws_sender, ws_receiver) = socket.split();
    let mut inbound = decode_frames(ws_receiver);

    let active = match handler.handshake(&mut inbound).await {
        Ok(active) => active,
        Err(e) => {
            warn!(error = %e, "WebSocket handshake refused");
            refuse(&mut ws_sender, &e).await;
            return;
        }
    };

    info!(
        username = %active.username(),
        session_id = %active.session().id,
        "WebSocket session opened"
    );

    // Engine messages -> JSON text frames
    let outbound = ws_sender.with(|message: Message| {
        future::ready(
            serde_json::to_string(&message)
                .map(|json| WsMessage::Text(json.into()))
                .map_err(axum::Error::new),
        )
    });

    active.run(inbound, outbound).await;
}

/// Turn raw frames into decoded messages. A close frame ends the stream;
/// pings and pongs are answered by axum and skipped here.
fn decode_frames<S>(frames: S) -> BoxStream<'static, Result<InboundMessage, InboundError>>
where
    S: futures_util::Stream<Item = Result<WsMessage, axum::Error>> + Send + 'static,
{
    frames
        .take_while(|frame| future::ready(!matches!(frame, Ok(WsMessage::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(WsMessage::Text(text)) => Some(
                    serde_json::from_str::<InboundMessage>(&text)
                        .map_err(|e| InboundError::Malformed(e.to_string())),
                ),
                Ok(WsMessage::Binary(_)) => Some(Err(InboundError::Malformed(
                    "binary frames are not supported".into(),
                ))),
                Ok(_) => None,
                Err(e) => Some(Err(InboundError::Transport(e.to_string()))),
            })
        })
        .boxed()
}

async fn refuse<S>(sender: &mut S, error: &HandshakeError)
where
    S: futures_util::Sink<WsMessage> + Unpin,
{
    if matches!(
        error,
        HandshakeError::ClosedBeforeHandshake | HandshakeError::Transport(_)
    ) {
        return;
    }
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: close_reason(&error.to_string()).into(),
    };
    let _ = sender.send(WsMessage::Close(Some(frame))).await;
    let _ = sender.close().await;
}

fn close_reason(text: &str) -> String {
    if text.len() <= MAX_CLOSE_REASON {
        return text.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
