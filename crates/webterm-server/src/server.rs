//! Accept loop: binds the TCP listener and spawns one gateway task per
//! connection. Sessions are independent; the registry is the only state
//! shared between them.

use crate::config::ServerConfig;
use crate::gateway;
use crate::pty::PtyFactory;
use crate::registry::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};
use webterm_core::{TermError, TermResult};

/// The terminal gateway server.
pub struct TerminalServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn PtyFactory>,
}

impl TerminalServer {
    pub fn new(config: ServerConfig, factory: Arc<dyn PtyFactory>) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.max_sessions));
        Self {
            config,
            registry,
            factory,
        }
    }

    /// The session registry, for diagnostics.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind the configured port and serve until the listener fails.
    pub async fn run(self) -> TermResult<()> {
        let addr: SocketAddr = format!("0.0.0.0:{}", self.config.port)
            .parse()
            .map_err(|e| TermError::Other(format!("invalid address: {e}")))?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TermError::Transport(format!("bind failed: {e}")))?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind an ephemeral port).
    pub async fn run_on(self, listener: TcpListener) -> TermResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, path = gateway::TERMINAL_PATH, "terminal gateway ready");
        }

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(remote = %remote, "connection accepted");
                    let registry = self.registry.clone();
                    let factory = self.factory.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            gateway::handle_connection(stream, registry, factory).await
                        {
                            warn!(remote = %remote, error = %e, "terminal connection error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "TCP accept failed");
                }
            }
        }
    }
}
