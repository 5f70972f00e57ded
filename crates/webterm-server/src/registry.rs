//! In-memory session registry.
//!
//! Maps session ids to the control handle of their shell process. Only the
//! gateway's connection-lifecycle handlers mutate the map; teardown is
//! check-and-remove so the socket-close and process-exit paths can race
//! without double-killing.

use crate::pty::ProcessControl;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use webterm_core::{TermError, TermResult};

/// One live session: a shell process bound to at most one socket.
pub struct SessionEntry {
    pub id: String,
    pub control: Arc<dyn ProcessControl>,
}

/// Registry of all active sessions, shared across connection tasks.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    /// Bind a session id to a process.
    ///
    /// Rejects ids that are already bound (a session id maps to at most one
    /// process and one transport at a time) and refuses new sessions once
    /// the cap is reached.
    pub async fn create(&self, id: &str, control: Arc<dyn ProcessControl>) -> TermResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(id) {
            return Err(TermError::SessionBusy(id.to_string()));
        }
        if sessions.len() >= self.max_sessions {
            return Err(TermError::SessionLimit(self.max_sessions));
        }
        info!(session_id = %id, active = sessions.len() + 1, "session created");
        sessions.insert(
            id.to_string(),
            SessionEntry {
                id: id.to_string(),
                control,
            },
        );
        Ok(())
    }

    /// Remove a session, returning its entry. Absent ids are a no-op.
    pub async fn remove(&self, id: &str) -> Option<SessionEntry> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.remove(id);
        if entry.is_some() {
            info!(session_id = %id, "session removed");
        }
        entry
    }

    /// Kill and unregister a session.
    ///
    /// Idempotent: whichever of the socket-close and process-exit handlers
    /// gets here first performs the kill; the other finds nothing to do.
    pub async fn teardown(&self, id: &str) {
        match self.remove(id).await {
            Some(entry) => entry.control.kill(),
            None => debug!(session_id = %id, "teardown for unknown session ignored"),
        }
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Number of active sessions.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Generate a random session id (16 bytes, hex-encoded).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}
