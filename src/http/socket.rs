//! Per-connection WebSocket plumbing
//!
//! The socket is split: a writer task drains the connection's outbound channel
//! while the read loop feeds inbound frames to the dispatcher.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::AppError;
use crate::mcp::rpc::app_error_to_json_rpc;
use crate::relay::{Dispatcher, Outbound, Role};

pub async fn serve_connection(socket: WebSocket, dispatcher: Dispatcher, role: Role, identity: String) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Outbound>();
    let connection_id = dispatcher.connect(role, &identity, outbound_tx);

    let writer_id = connection_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if let Err(err) = sink.send(Message::Text(text.into())).await {
                        debug!(connection_id = %writer_id, error = %err, "socket write failed");
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => dispatcher.handle_frame(&connection_id, text.as_str()),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatcher.handle_frame(&connection_id, text),
                Err(_) => dispatcher.reject_binary_frame(&connection_id),
            },
            Ok(Message::Close(frame)) => {
                debug!(connection_id = %connection_id, frame = ?frame, "peer closed socket");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "socket read failed");
                break;
            }
        }
    }

    dispatcher.disconnect(&connection_id);
    if let Err(err) = writer.await {
        warn!(connection_id = %connection_id, error = %err, "socket writer task failed");
    }
}

/// Tells an unauthenticated peer why, then closes with policy violation.
pub async fn reject_connection(mut socket: WebSocket, role: Role, err: AppError) {
    info!(role = ?role, error = %err, "socket rejected");
    let frame = app_error_to_json_rpc(None, err).encode();

    if socket.send(Message::Text(frame.into())).await.is_err() {
        return;
    }
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "authentication failed".into(),
        })))
        .await;
}
