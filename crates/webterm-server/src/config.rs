//! Server configuration: TOML file + environment + CLI overrides.
//!
//! The shell path and workspace directory come from the environment
//! (`SHELL`, `WORKSPACE_DIR`) when neither the config file nor the CLI
//! names them.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use webterm_core::{TermError, TermResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub shell: Option<String>,
    pub workspace: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            shell: None,
            workspace: None,
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_port() -> u16 {
    3001
}
fn default_max_sessions() -> usize {
    100
}

/// Resolved server configuration (paths expanded, overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub shell: String,
    pub workspace: PathBuf,
    pub max_sessions: usize,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply environment defaults and
    /// CLI overrides (CLI > file > environment > built-in).
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_shell: Option<&str>,
        cli_workspace: Option<&str>,
        cli_max_sessions: Option<usize>,
    ) -> TermResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TermError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile::default()
            }
        } else {
            ConfigFile::default()
        };

        let port = cli_port
            .or(file_config.server.port)
            .or_else(|| {
                std::env::var("BACKEND_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .unwrap_or_else(default_port);

        let shell = cli_shell
            .map(str::to_string)
            .or(file_config.server.shell)
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/sh".to_string());

        let workspace = cli_workspace
            .map(str::to_string)
            .or(file_config.server.workspace)
            .or_else(|| std::env::var("WORKSPACE_DIR").ok())
            .map(|s| expand_tilde_str(&s))
            .map(Ok)
            .unwrap_or_else(|| {
                std::env::current_dir()
                    .map_err(|e| TermError::Other(format!("cannot resolve working dir: {e}")))
            })?;

        let max_sessions = cli_max_sessions.unwrap_or(file_config.server.max_sessions);

        Ok(Self {
            port,
            shell,
            workspace,
            max_sessions,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
