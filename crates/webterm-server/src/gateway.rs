//! WebSocket transport gateway.
//!
//! Accepts upgrades on `/ws/terminal`, binds each connection to a freshly
//! spawned shell process, and relays typed JSON messages between the PTY
//! and the remote socket. Per-connection state machine:
//! `CONNECTING → BOUND → CLOSED`.

use crate::pty::{ProcessControl, ProcessHandle, PtyFactory};
use crate::registry::{generate_session_id, SessionRegistry};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};
use webterm_core::{ClientFrame, ClientMessage, ExitStatus, ServerMessage, TermError, TermResult};

/// Upgrade path for the terminal endpoint.
pub const TERMINAL_PATH: &str = "/ws/terminal";

/// Notice sent when the host cannot provide a PTY.
pub const UNAVAILABLE_NOTICE: &str = "Terminal not available on this server";

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Drive one terminal connection from handshake to teardown.
pub async fn handle_connection(
    stream: TcpStream,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn PtyFactory>,
) -> TermResult<()> {
    // Capture the session id (if any) during the HTTP upgrade; reject
    // upgrades on any other path.
    let mut requested_id: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() != TERMINAL_PATH {
            let mut not_found = ErrorResponse::new(Some("not found".to_string()));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            return Err(not_found);
        }
        requested_id = req.uri().query().and_then(session_id_from_query);
        Ok(resp)
    };

    let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TermError::Transport(format!("WebSocket handshake failed: {e}")))?;

    // A client-supplied id is a correlation hint only; a fresh process is
    // spawned either way.
    let session_id = requested_id.unwrap_or_else(generate_session_id);
    info!(session_id = %session_id, "terminal connection");

    let (mut ws_tx, mut ws_rx) = ws.split();

    // CONNECTING: spawn the shell. A host without a working PTY still
    // accepts the socket, reports the failure, and closes cleanly.
    let handle = match factory.spawn() {
        Ok(handle) => handle,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "PTY spawn failed");
            send_message(
                &mut ws_tx,
                &ServerMessage::Error {
                    data: UNAVAILABLE_NOTICE.to_string(),
                },
            )
            .await?;
            close_normal(&mut ws_tx).await;
            return Ok(());
        }
    };

    if let Err(e) = registry.create(&session_id, handle.control.clone()).await {
        warn!(session_id = %session_id, error = %e, "session rejected");
        handle.control.kill();
        send_message(&mut ws_tx, &ServerMessage::Error { data: e.to_string() }).await?;
        close_normal(&mut ws_tx).await;
        return Ok(());
    }

    // BOUND. Teardown runs exactly once regardless of which path ends the
    // loop; the registry's check-and-remove makes the second caller a no-op.
    let result = run_bound(&mut ws_tx, &mut ws_rx, handle, &session_id).await;
    registry.teardown(&session_id).await;
    result
}

/// Relay loop for a bound session. Returns when the socket closes, the
/// socket errors, or the process exits.
async fn run_bound(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    handle: ProcessHandle,
    session_id: &str,
) -> TermResult<()> {
    let ProcessHandle {
        input,
        mut output,
        mut exit,
        control,
    } = handle;

    send_message(
        ws_tx,
        &ServerMessage::Session {
            session_id: session_id.to_string(),
        },
    )
    .await?;

    let mut output_done = false;
    loop {
        tokio::select! {
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_client_frame(&text, &input, control.as_ref()).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    handle_client_frame(&text, &input, control.as_ref()).await;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws_tx.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(session_id = %session_id, "socket closed");
                    return Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "socket error");
                    return Ok(());
                }
            },
            chunk = output.recv(), if !output_done => match chunk {
                Some(bytes) => {
                    let data = String::from_utf8_lossy(&bytes).into_owned();
                    if send_message(ws_tx, &ServerMessage::Output { data }).await.is_err() {
                        // Socket is gone; remaining output is dropped.
                        return Ok(());
                    }
                }
                // Reader hit EOF; keep relaying input until the exit status lands.
                None => output_done = true,
            },
            status = &mut exit => {
                // The exit status can land while output chunks are still
                // queued; deliver those first so nothing emitted before the
                // exit is lost.
                if !output_done {
                    while let Ok(bytes) = output.try_recv() {
                        let data = String::from_utf8_lossy(&bytes).into_owned();
                        if send_message(ws_tx, &ServerMessage::Output { data }).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                let status = status.unwrap_or(ExitStatus { code: -1, signal: None });
                info!(session_id = %session_id, code = status.code, "shell exited");
                let _ = send_message(
                    ws_tx,
                    &ServerMessage::Exit {
                        exit_code: status.code,
                        signal: status.signal,
                    },
                )
                .await;
                close_normal(ws_tx).await;
                return Ok(());
            }
        }
    }
}

/// Dispatch one inbound frame. Unrecognized tags and non-JSON payloads are
/// forwarded to the PTY as raw input; write-after-death is swallowed since
/// the exit path already notified the client.
async fn handle_client_frame(
    text: &str,
    input: &mpsc::Sender<Vec<u8>>,
    control: &dyn ProcessControl,
) {
    match ClientFrame::decode(text) {
        ClientFrame::Message(ClientMessage::Input { data }) | ClientFrame::Raw(data) => {
            let _ = input.send(data.into_bytes()).await;
        }
        ClientFrame::Message(ClientMessage::Resize { cols, rows }) => {
            control.resize(cols, rows);
        }
        ClientFrame::Ignored => {}
    }
}

async fn send_message(ws_tx: &mut WsSink, msg: &ServerMessage) -> TermResult<()> {
    let text = serde_json::to_string(msg)
        .map_err(|e| TermError::Transport(format!("encode failed: {e}")))?;
    ws_tx
        .send(Message::Text(text))
        .await
        .map_err(|e| TermError::Transport(format!("WS send failed: {e}")))
}

/// Close with code 1000 so the client treats the disconnect as intentional
/// and does not auto-reconnect.
async fn close_normal(ws_tx: &mut WsSink) {
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        })))
        .await;
}

fn session_id_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "sessionId" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_query_parsing() {
        assert_eq!(
            session_id_from_query("sessionId=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            session_id_from_query("foo=bar&sessionId=abc"),
            Some("abc".to_string())
        );
        assert_eq!(session_id_from_query("sessionId="), None);
        assert_eq!(session_id_from_query("foo=bar"), None);
        assert_eq!(session_id_from_query(""), None);
    }
}
