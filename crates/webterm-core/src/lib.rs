//! webterm-core: shared protocol library for the webterm terminal layer.
//!
//! Defines the JSON message vocabulary exchanged over the `/ws/terminal`
//! WebSocket, the lenient inbound decoders used on both ends of the
//! connection, and the error taxonomy shared by the server and client crates.

pub mod error;
pub mod protocol;

// Re-export commonly used items at crate root.
pub use error::{TermError, TermResult};
pub use protocol::{ClientFrame, ClientMessage, ExitStatus, ServerFrame, ServerMessage};
