//! webterm-server: terminal session gateway.
//!
//! Accepts WebSocket connections on `/ws/terminal`, spawns one PTY-backed
//! shell process per connection, and relays typed JSON messages between the
//! process and the remote socket.

pub mod config;
pub mod gateway;
pub mod pty;
pub mod registry;
pub mod server;
