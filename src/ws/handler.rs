//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::session::InputMailbox;
use crate::game::{HostCommand, InputSample};
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, EntityId, ServerMsg};

/// Outbound frames buffered per session before the host starts dropping
const OUTBOUND_QUEUE: usize = 128;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session_id: EntityId = Uuid::new_v4().to_string();
    info!(session_id = %session_id, "New WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    // The host owns the only strong sender; dropping it ends the writer
    let pong_tx = outbound_tx.downgrade();
    let mailbox = Arc::new(InputMailbox::new(unix_millis()));

    let connect = HostCommand::Connect {
        id: session_id.clone(),
        mailbox: mailbox.clone(),
        outbound: outbound_tx,
    };
    if state.host.commands.send(connect).await.is_err() {
        error!(session_id = %session_id, "Host simulation is not running");
        return;
    }

    let reason = run_session(
        &session_id,
        ws_sink,
        ws_stream,
        pong_tx,
        outbound_rx,
        &mailbox,
    )
    .await;

    // No more input from this session, even before the host processes the close
    mailbox.close();
    let _ = state
        .host
        .commands
        .send(HostCommand::Disconnect {
            id: session_id.clone(),
            reason,
        })
        .await;

    info!(session_id = %session_id, reason, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split. Returns the close reason.
async fn run_session(
    session_id: &str,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    pong_tx: mpsc::WeakSender<String>,
    mut outbound_rx: mpsc::Receiver<String>,
    mailbox: &InputMailbox,
) -> &'static str {
    let rate_limiter = SessionRateLimiter::new();

    // Writer task: host frames -> WebSocket. Ends when the host drops the session.
    let writer_id = session_id.to_string();
    let mut writer_handle = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = ws_sink.send(Message::Text(frame)).await {
                debug!(session_id = %writer_id, error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let reason = loop {
        let result = tokio::select! {
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break "disconnected",
            },
            _ = &mut writer_handle => break "closed by host",
        };

        let now = unix_millis();
        match result {
            Ok(Message::Text(text)) => {
                mailbox.touch(now);
                if !rate_limiter.check_frame() {
                    debug!(session_id = %session_id, "Rate limited frame");
                    continue;
                }
                match ClientMsg::decode(&text) {
                    Ok(ClientMsg::Input {
                        steer,
                        throttle,
                        seq,
                        t,
                        ..
                    }) => {
                        mailbox.offer(InputSample::new(steer, throttle, seq, t), now);
                    }
                    Ok(ClientMsg::Ping { t }) => match (ServerMsg::Pong { t }).encode() {
                        Ok(frame) => {
                            if let Some(tx) = pong_tx.upgrade() {
                                let _ = tx.try_send(frame);
                            }
                        }
                        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode pong"),
                    },
                    Ok(ClientMsg::Pong { .. }) => {}
                    Err(e) => {
                        debug!(session_id = %session_id, error = %e, "Dropping malformed frame");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                mailbox.touch(now);
                debug!(session_id = %session_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                mailbox.touch(now);
            }
            Ok(Message::Close(_)) => {
                debug!(session_id = %session_id, "Client initiated close");
                break "disconnected";
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "WebSocket error");
                break "transport error";
            }
        }
    };

    writer_handle.abort();
    reason
}
