//! PTY process adapter built on portable-pty.
//!
//! Wraps OS-level shell spawning behind a capability-checked factory so the
//! gateway stays independent of the host's PTY mechanism. A host without a
//! working PTY surfaces `TermError::PtyUnavailable` from `spawn`, which the
//! gateway turns into an `error` message and a clean close.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use webterm_core::{ExitStatus, TermError, TermResult};

/// Default terminal geometry for new sessions.
pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

/// Control operations on a live shell process.
///
/// Both operations are safe after the process has died: resize becomes a
/// no-op and repeated kills are swallowed.
pub trait ProcessControl: Send + Sync {
    fn resize(&self, cols: u16, rows: u16);
    fn kill(&self);
}

/// Uniform handle for one spawned shell + PTY.
///
/// The channel halves are owned by the connection that drives the session;
/// the control half is shared with the session registry for teardown.
pub struct ProcessHandle {
    /// Verbatim input bytes. Sends to a dead process are dropped.
    pub input: mpsc::Sender<Vec<u8>>,
    /// Output chunks in emission order, one per OS-delivered read.
    pub output: mpsc::Receiver<Vec<u8>>,
    /// Resolves exactly once when the process terminates.
    pub exit: oneshot::Receiver<ExitStatus>,
    /// Resize/kill control.
    pub control: Arc<dyn ProcessControl>,
}

/// Capability seam for PTY spawning.
pub trait PtyFactory: Send + Sync {
    fn spawn(&self) -> TermResult<ProcessHandle>;
}

/// `PtyFactory` backed by the host's native PTY mechanism.
pub struct NativePtyFactory {
    shell: String,
    workdir: PathBuf,
    env: HashMap<String, String>,
}

impl NativePtyFactory {
    pub fn new(shell: impl Into<String>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            workdir: workdir.into(),
            env: HashMap::new(),
        }
    }

    /// Add an extra environment variable for spawned shells.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl PtyFactory for NativePtyFactory {
    fn spawn(&self) -> TermResult<ProcessHandle> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| TermError::PtyUnavailable(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.cwd(&self.workdir);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| TermError::Spawn(format!("failed to spawn {}: {e}", self.shell)))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| TermError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| TermError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        info!(shell = %self.shell, workdir = %self.workdir.display(), "PTY spawned");

        let (input_tx, input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();

        spawn_reader(reader, output_tx);
        spawn_writer(writer, input_rx);
        spawn_waiter(child, exit_tx);

        Ok(ProcessHandle {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: Arc::new(NativeControl {
                master: Mutex::new(pair.master),
                killer: Mutex::new(killer),
                killed: AtomicBool::new(false),
            }),
        })
    }
}

/// Blocking PTY reads, bridged to an async channel. Ends on EOF (process
/// exit) or when the receiver is dropped.
fn spawn_reader(mut reader: Box<dyn Read + Send>, output_tx: mpsc::Sender<Vec<u8>>) {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Blocking PTY writes. Write errors end the task; the input sender then
/// fails, which the gateway treats as write-after-death and swallows.
fn spawn_writer(mut writer: Box<dyn Write + Send>, mut input_rx: mpsc::Receiver<Vec<u8>>) {
    tokio::task::spawn_blocking(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).and_then(|_| writer.flush()).is_err() {
                break;
            }
        }
    });
}

fn spawn_waiter(
    mut child: Box<dyn portable_pty::Child + Send + Sync>,
    exit_tx: oneshot::Sender<ExitStatus>,
) {
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        };
        debug!(code, "PTY child exited");
        // portable-pty does not surface the terminating signal.
        let _ = exit_tx.send(ExitStatus { code, signal: None });
    });
}

struct NativeControl {
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    killed: AtomicBool,
}

impl ProcessControl for NativeControl {
    fn resize(&self, cols: u16, rows: u16) {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let Ok(master) = self.master.lock() else {
            return;
        };
        match master.resize(size) {
            Ok(()) => debug!(cols, rows, "PTY resized"),
            Err(e) => debug!(error = %e, "resize on dead PTY ignored"),
        }
    }

    fn kill(&self) {
        if self.killed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(mut killer) = self.killer.lock() else {
            return;
        };
        if let Err(e) = killer.kill() {
            debug!(error = %e, "kill on dead process ignored");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[cfg(unix)]
    #[tokio::test]
    async fn shell_exit_code_is_reported() {
        let factory = NativePtyFactory::new("/bin/sh", std::env::temp_dir());
        let mut handle = factory.spawn().expect("spawn");

        handle
            .input
            .send(b"exit 7\n".to_vec())
            .await
            .expect("write");

        let status = tokio::time::timeout(Duration::from_secs(10), handle.exit)
            .await
            .expect("exit within timeout")
            .expect("exit resolves");
        assert_eq!(status.code, 7);

        // Output channel drains to EOF after exit.
        while handle.output.recv().await.is_some() {}
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_is_forwarded_in_chunks() {
        let factory = NativePtyFactory::new("/bin/sh", std::env::temp_dir());
        let mut handle = factory.spawn().expect("spawn");

        handle
            .input
            .send(b"echo marker_xyz; exit 0\n".to_vec())
            .await
            .expect("write");

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while let Ok(Some(chunk)) =
            tokio::time::timeout_at(deadline, handle.output.recv()).await
        {
            collected.extend_from_slice(&chunk);
            if String::from_utf8_lossy(&collected).contains("marker_xyz") {
                break;
            }
        }
        assert!(String::from_utf8_lossy(&collected).contains("marker_xyz"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_is_idempotent() {
        let factory = NativePtyFactory::new("/bin/sh", std::env::temp_dir());
        let handle = factory.spawn().expect("spawn");

        handle.control.kill();
        handle.control.kill();

        let status = tokio::time::timeout(Duration::from_secs(10), handle.exit)
            .await
            .expect("exit within timeout");
        assert!(status.is_ok());
    }
}
