//! webterm — interactive terminal client CLI.
//!
//! Connects to a webterm-server terminal endpoint over WebSocket, enters raw
//! terminal mode, and pipes stdin/stdout between the local terminal and the
//! remote shell. Terminal resize events are forwarded to the server, and
//! dropped connections are resumed automatically by the client layer.

mod terminal;

use anyhow::Result;
use clap::Parser;
use crossterm::event::{self, Event, KeyCode, KeyModifiers};
use std::io::Write;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webterm_client::{ClientConfig, ClientEvent, ConnectionState, TerminalClient};

use crate::terminal as term;

/// webterm — terminal session client
#[derive(Parser)]
#[command(name = "webterm", version, about = "Interactive terminal sessions over WebSocket")]
struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 3001)]
    port: u16,

    /// Request a specific session id
    #[arg(short, long)]
    session: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Logs go to stderr so they don't corrupt the raw terminal stream.
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("webterm=debug,webterm_cli=debug,webterm_client=debug")
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("webterm=warn,webterm_cli=warn")
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    if let Err(e) = run(&cli).await {
        eprintln!("webterm: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let url = format!("ws://{}:{}/ws/terminal", cli.host, cli.port);
    info!(url = %url, "connecting");

    let config = ClientConfig::new(&url);
    let max_reconnects = config.max_reconnects;
    let client = TerminalClient::new(config);

    // Remote output goes straight to the local terminal.
    client.on_data(|data| {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(data.as_bytes());
        let _ = stdout.flush();
    });

    // Re-establish geometry on every (re)connect.
    let resize_client = client.clone();
    client.on_connect(move |event| {
        if let ClientEvent::Connected { session_id } = event {
            debug!(session_id = ?session_id, "connected");
            let (cols, rows) = term::get_terminal_size();
            resize_client.resize(cols, rows);
        }
    });

    let (tx_closed, mut rx_closed) = mpsc::unbounded_channel::<u16>();
    client.on_disconnect(move |event| {
        if let ClientEvent::Disconnected { code } = event {
            let _ = tx_closed.send(*code);
        }
    });

    client.on_error(|event| {
        if let ClientEvent::Error { message } = event {
            warn!("{message}");
        }
    });

    match &cli.session {
        Some(id) => client.connect_with(id),
        None => client.connect(),
    }

    let _guard = term::RawModeGuard::enter()?;

    let (tx_input, mut rx_input) = mpsc::channel::<Vec<u8>>(64);
    let (tx_resize, mut rx_resize) = mpsc::channel::<(u16, u16)>(8);
    let (tx_quit, mut rx_quit) = mpsc::channel::<()>(1);

    // Blocking thread reading crossterm events (stdin + resize).
    let input_handle = tokio::task::spawn_blocking(move || loop {
        match event::read() {
            Ok(Event::Key(key_event)) => {
                // Ctrl+] is the escape sequence to disconnect (like ssh ~.).
                if key_event.modifiers.contains(KeyModifiers::CONTROL)
                    && key_event.code == KeyCode::Char(']')
                {
                    let _ = tx_quit.blocking_send(());
                    break;
                }

                if let Some(bytes) = key_event_to_bytes(&key_event) {
                    if tx_input.blocking_send(bytes).is_err() {
                        break;
                    }
                }
            }
            Ok(Event::Resize(new_cols, new_rows)) => {
                let _ = tx_resize.blocking_send((new_cols, new_rows));
            }
            Ok(_) => {}
            Err(e) => {
                warn!("crossterm event error: {e}");
                break;
            }
        }
    });

    let mut check = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            Some(bytes) = rx_input.recv() => {
                client.send(&String::from_utf8_lossy(&bytes));
            }
            Some((cols, rows)) = rx_resize.recv() => {
                client.resize(cols, rows);
            }
            Some(code) = rx_closed.recv() => {
                if code == 1000 {
                    break;
                }
                debug!(code, "connection lost");
            }
            _ = rx_quit.recv() => {
                info!("disconnect requested");
                client.disconnect();
                break;
            }
            _ = check.tick() => {
                // Reconnect ceiling reached with no connection left.
                if client.state() == ConnectionState::ClosedError
                    && client.reconnect_attempts() >= max_reconnects
                {
                    anyhow::bail!("connection lost and could not be re-established");
                }
            }
        }
    }

    input_handle.abort();
    eprintln!("\r\nConnection to {} closed.", cli.host);
    Ok(())
}

/// Escape sequences for F1-F12, in order.
const FUNCTION_KEYS: [&[u8]; 12] = [
    b"\x1bOP", b"\x1bOQ", b"\x1bOR", b"\x1bOS", b"\x1b[15~", b"\x1b[17~",
    b"\x1b[18~", b"\x1b[19~", b"\x1b[20~", b"\x1b[21~", b"\x1b[23~", b"\x1b[24~",
];

/// Convert a crossterm key event to raw bytes suitable for a PTY.
fn key_event_to_bytes(event: &crossterm::event::KeyEvent) -> Option<Vec<u8>> {
    let seq: &[u8] = match event.code {
        KeyCode::Char(c) => {
            if event.modifiers.contains(KeyModifiers::CONTROL) {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                let byte = (c as u8).wrapping_sub(b'a').wrapping_add(1);
                if byte <= 26 {
                    return Some(vec![byte]);
                }
            }
            let mut buf = [0u8; 4];
            return Some(c.encode_utf8(&mut buf).as_bytes().to_vec());
        }
        KeyCode::Enter => b"\r",
        KeyCode::Backspace => b"\x7f",
        KeyCode::Tab => b"\t",
        KeyCode::Esc => b"\x1b",
        KeyCode::Up => b"\x1b[A",
        KeyCode::Down => b"\x1b[B",
        KeyCode::Right => b"\x1b[C",
        KeyCode::Left => b"\x1b[D",
        KeyCode::Home => b"\x1b[H",
        KeyCode::End => b"\x1b[F",
        KeyCode::PageUp => b"\x1b[5~",
        KeyCode::PageDown => b"\x1b[6~",
        KeyCode::Insert => b"\x1b[2~",
        KeyCode::Delete => b"\x1b[3~",
        KeyCode::F(n) => *FUNCTION_KEYS.get(usize::from(n).checked_sub(1)?)?,
        _ => return None,
    };
    Some(seq.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_chars_map_to_low_bytes() {
        let ev = crossterm::event::KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL);
        assert_eq!(key_event_to_bytes(&ev), Some(vec![0x03]));
    }

    #[test]
    fn enter_is_carriage_return() {
        let ev = crossterm::event::KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&ev), Some(vec![b'\r']));
    }

    #[test]
    fn arrow_keys_are_csi_sequences() {
        let ev = crossterm::event::KeyEvent::new(KeyCode::Up, KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&ev), Some(b"\x1b[A".to_vec()));
    }

    #[test]
    fn function_keys_map_through_the_table() {
        let f1 = crossterm::event::KeyEvent::new(KeyCode::F(1), KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&f1), Some(b"\x1bOP".to_vec()));
        let f12 = crossterm::event::KeyEvent::new(KeyCode::F(12), KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&f12), Some(b"\x1b[24~".to_vec()));
        let f13 = crossterm::event::KeyEvent::new(KeyCode::F(13), KeyModifiers::NONE);
        assert_eq!(key_event_to_bytes(&f13), None);
    }
}
