use thiserror::Error;

/// Errors produced by the terminal session layer.
#[derive(Debug, Error)]
pub enum TermError {
    /// The host cannot provide a pseudo-terminal at all (missing native
    /// mechanism). Reported to the client, never fatal to the gateway.
    #[error("pty unavailable: {0}")]
    PtyUnavailable(String),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session already bound: {0}")]
    SessionBusy(String),

    #[error("session limit reached ({0})")]
    SessionLimit(usize),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type TermResult<T> = Result<T, TermError>;
