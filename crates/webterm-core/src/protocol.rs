//! JSON transport messages for the `/ws/terminal` WebSocket.
//!
//! Every frame is one UTF-8 JSON text object carrying a `type` tag. Message
//! boundaries carry no relation to line boundaries of the underlying byte
//! stream. Inbound decoding on both sides is lenient by contract: frames
//! that fail to parse, or that carry an unrecognized tag, degrade to raw
//! text instead of being rejected.

use serde::{Deserialize, Serialize};

/// Exit information for a terminated shell process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub signal: Option<i32>,
}

/// Messages sent server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Announces the session id bound to this connection.
    Session {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// A chunk of raw PTY output. Chunk granularity is whatever the OS
    /// delivered and must not be relied upon.
    Output { data: String },
    /// The shell process terminated.
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    /// A human-readable failure notice.
    Error { data: String },
}

/// Messages sent client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Text written verbatim to the PTY input. No escaping, no newline
    /// normalization.
    Input {
        #[serde(default)]
        data: String,
    },
    /// New terminal geometry.
    Resize { cols: u16, rows: u16 },
}

/// Result of leniently decoding a client → server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// A well-formed message.
    Message(ClientMessage),
    /// A non-JSON payload, or a JSON object with an unrecognized tag. The
    /// carried text is forwarded to the PTY as input.
    Raw(String),
    /// A recognizable frame with nothing actionable (e.g. a resize with
    /// missing or non-positive geometry). Dropped.
    Ignored,
}

impl ClientFrame {
    /// Decode an inbound text frame. Never fails.
    pub fn decode(text: &str) -> Self {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return ClientFrame::Raw(text.to_string()),
        };

        match value.get("type").and_then(|t| t.as_str()) {
            Some("input") => {
                let data = text_field(&value, "data").unwrap_or_default();
                ClientFrame::Message(ClientMessage::Input { data })
            }
            Some("resize") => match (dimension(&value, "cols"), dimension(&value, "rows")) {
                (Some(cols), Some(rows)) => {
                    ClientFrame::Message(ClientMessage::Resize { cols, rows })
                }
                _ => ClientFrame::Ignored,
            },
            // Unrecognized tags are forwarded as raw input so newer clients
            // keep working against this server.
            _ => ClientFrame::Raw(text_field(&value, "data").unwrap_or_default()),
        }
    }
}

/// Result of leniently decoding a server → client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// A well-formed message.
    Message(ServerMessage),
    /// A non-JSON payload, displayed to the user as-is.
    Raw(String),
    /// JSON with an unrecognized shape and no text payload. Dropped.
    Ignored,
}

impl ServerFrame {
    /// Decode an inbound text frame. Never fails.
    pub fn decode(text: &str) -> Self {
        if let Ok(msg) = serde_json::from_str::<ServerMessage>(text) {
            return ServerFrame::Message(msg);
        }
        match serde_json::from_str::<serde_json::Value>(text) {
            // Unknown tag but a text payload: display it like output.
            Ok(value) => match text_field(&value, "data") {
                Some(data) => ServerFrame::Message(ServerMessage::Output { data }),
                None => ServerFrame::Ignored,
            },
            Err(_) => ServerFrame::Raw(text.to_string()),
        }
    }
}

fn text_field(value: &serde_json::Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(str::to_string)
}

/// Extract a terminal dimension, rejecting missing, zero, negative and
/// out-of-range values.
fn dimension(value: &serde_json::Value, key: &str) -> Option<u16> {
    let n = value.get(key)?.as_u64()?;
    if n == 0 || n > u16::MAX as u64 {
        return None;
    }
    Some(n as u16)
}
