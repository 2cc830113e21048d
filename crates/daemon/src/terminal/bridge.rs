//! WebSocket <-> PTY bridge
//!
//! Frames, client to server: text `{"type":"data","payload":"..."}`,
//! text `{"type":"resize","cols":N,"rows":N}`, or binary raw input.
//! Server to client: `{"type":"ready"}` once the PTY is attached, binary
//! PTY output, then `{"type":"exit"}` before the socket closes.
//!
//! Input is only read after `ready` is sent, so nothing typed early is lost;
//! it waits in the socket until the PTY exists.

use super::{short, TerminalManager, TerminalSession};
use crate::ssh::{PtyHandle, PtyInput};
use axum::extract::ws::Message;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Control frames sent by the browser
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    Data { payload: String },
    Resize { cols: u32, rows: u32 },
}

/// Control frames sent to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    Ready,
    Exit,
    Error { message: String },
}

impl ServerFrame {
    fn to_message(&self) -> Message {
        // Serializing a fieldless or string-only enum cannot fail
        Message::Text(serde_json::to_string(self).unwrap_or_default())
    }
}

/// Translate a client message into PTY input; `None` means ignore
pub fn decode_client_message(msg: Message) -> Option<PtyInput> {
    match msg {
        Message::Binary(data) => Some(PtyInput::Data(data)),
        Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Data { payload }) => Some(PtyInput::Data(payload.into_bytes())),
            Ok(ClientFrame::Resize { cols, rows }) if cols > 0 && rows > 0 => {
                Some(PtyInput::Resize { cols, rows })
            }
            Ok(ClientFrame::Resize { .. }) => None,
            Err(e) => {
                debug!("Ignoring malformed terminal frame: {}", e);
                None
            }
        },
        _ => None,
    }
}

/// Serve one authorized session over an upgraded socket.
///
/// Returns when either side hangs up or the session is closed elsewhere.
/// The session is removed on the way out.
pub async fn serve<W, R, E>(
    manager: &TerminalManager,
    session: Arc<TerminalSession>,
    mut ws_tx: W,
    mut ws_rx: R,
) where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let session_id = session.id();

    match manager.attach(&session).await {
        Ok(pty) => {
            if ws_tx.send(ServerFrame::Ready.to_message()).await.is_ok() {
                pump(&session, pty, &mut ws_tx, &mut ws_rx).await;
            }
        }
        Err(e) => {
            warn!(session_id = %short(&session_id), "PTY attach failed: {}", e);
            let frame = ServerFrame::Error {
                message: e.to_string(),
            };
            let _ = ws_tx.send(frame.to_message()).await;
        }
    }

    let _ = ws_tx.send(ServerFrame::Exit.to_message()).await;
    let _ = ws_tx.send(Message::Close(None)).await;
    let _ = ws_tx.close().await;

    if let Err(e) = manager.close_session(&session_id) {
        warn!("Failed to remove terminal session: {}", e);
    }
}

/// Run both copy loops until one ends, then drop the PTY.
async fn pump<W, R, E>(session: &TerminalSession, pty: PtyHandle, ws_tx: &mut W, ws_rx: &mut R)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let PtyHandle { input, mut output } = pty;

    tokio::select! {
        _ = session.cancelled() => debug!("Terminal session cancelled"),
        _ = client_to_pty(session, ws_rx, input) => debug!("Client side of terminal ended"),
        _ = pty_to_client(session, &mut output, ws_tx) => debug!("PTY side of terminal ended"),
    }
    // `input` went with its loop; the remote channel closes when it drops
}

async fn client_to_pty<R, E>(session: &TerminalSession, ws_rx: &mut R, input: mpsc::Sender<PtyInput>)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by client");
                break;
            }
            Ok(msg) => msg,
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        };
        let Some(pty_input) = decode_client_message(msg) else {
            continue;
        };
        session.touch();
        trace!(?pty_input, "client -> pty");
        if input.send(pty_input).await.is_err() {
            break;
        }
    }
}

async fn pty_to_client<W>(session: &TerminalSession, output: &mut mpsc::Receiver<Vec<u8>>, ws_tx: &mut W)
where
    W: Sink<Message> + Unpin,
    W::Error: Display,
{
    while let Some(chunk) = output.recv().await {
        session.touch();
        trace!("pty -> client: {} bytes", chunk.len());
        if let Err(e) = ws_tx.send(Message::Binary(chunk)).await {
            debug!("Failed to send to WebSocket: {}", e);
            break;
        }
    }
}
