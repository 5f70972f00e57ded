//! webterm-client: reconnecting WebSocket client for the terminal layer.
//!
//! `TerminalClient` hides connection churn behind a stable callback API and
//! queues input sent while disconnected; `LineBuffer` reassembles the
//! chunked output stream into display lines.

pub mod client;
pub mod line_buffer;

pub use client::{CallbackId, ClientConfig, ClientEvent, ConnectionState, TerminalClient};
pub use line_buffer::LineBuffer;
