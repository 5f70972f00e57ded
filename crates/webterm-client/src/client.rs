//! Reconnecting WebSocket wrapper for the terminal endpoint.
//!
//! Hides connection churn from the caller behind a stable callback API
//! (data, connect, disconnect, error), queues input sent while disconnected,
//! and reconnects with exponential backoff after abnormal closes. Transport
//! faults never escape as panics or error returns; they surface only on the
//! error-callback channel.
//!
//! All methods must be called from within a tokio runtime: `connect` spawns
//! the connection task.

use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use webterm_core::{ClientMessage, ServerFrame, ServerMessage};

/// WebSocket close code for a clean, intentional disconnect.
const CLOSE_NORMAL: u16 = 1000;
/// Synthetic close code used when the connection drops without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

/// Connection state as seen by the wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    ClosedClean,
    ClosedError,
}

/// Lifecycle events delivered to connect/disconnect/error callbacks.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected { session_id: Option<String> },
    Disconnected { code: u16 },
    Error { message: String },
}

/// Identifies a registered callback for later removal.
pub type CallbackId = u64;

/// Wrapper configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:3001/ws/terminal`.
    pub endpoint: String,
    /// First reconnect delay; doubled for each subsequent attempt.
    pub base_delay: Duration,
    /// Automatic reconnect ceiling.
    pub max_reconnects: u32,
}

impl ClientConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            base_delay: Duration::from_secs(1),
            max_reconnects: 5,
        }
    }
}

type DataCallback = Arc<dyn Fn(&str) + Send + Sync>;
type EventCallback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

struct Inner {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    session_id: Mutex<Option<String>>,
    reconnect_attempts: AtomicU32,
    /// Bumped by `disconnect` to cancel in-flight scheduled reconnects.
    generation: AtomicU64,
    next_callback_id: AtomicU64,
    pending_input: Mutex<VecDeque<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    data_callbacks: Mutex<Vec<(CallbackId, DataCallback)>>,
    connect_callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
    disconnect_callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
    error_callbacks: Mutex<Vec<(CallbackId, EventCallback)>>,
}

/// Reconnecting client for the terminal WebSocket endpoint.
///
/// Cheap to clone; clones share the same connection and callbacks.
#[derive(Clone)]
pub struct TerminalClient {
    inner: Arc<Inner>,
}

impl TerminalClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ConnectionState::Idle),
                session_id: Mutex::new(None),
                reconnect_attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                next_callback_id: AtomicU64::new(1),
                pending_input: Mutex::new(VecDeque::new()),
                outbound: Mutex::new(None),
                data_callbacks: Mutex::new(Vec::new()),
                connect_callbacks: Mutex::new(Vec::new()),
                disconnect_callbacks: Mutex::new(Vec::new()),
                error_callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Open the connection. No-op while already open or connecting.
    pub fn connect(&self) {
        {
            let mut state = lock(&self.inner.state);
            if matches!(
                *state,
                ConnectionState::Open | ConnectionState::Connecting
            ) {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        let inner = self.inner.clone();
        tokio::spawn(run_connection(inner));
    }

    /// Open the connection, requesting a specific session id.
    pub fn connect_with(&self, session_id: &str) {
        *lock(&self.inner.session_id) = Some(session_id.to_string());
        self.connect();
    }

    /// Send input to the terminal. Queued in FIFO order while disconnected
    /// and flushed on the next successful connect.
    pub fn send(&self, data: &str) {
        if self.state() == ConnectionState::Open
            && send_frame(
                &self.inner,
                &ClientMessage::Input {
                    data: data.to_string(),
                },
            )
        {
            return;
        }
        lock(&self.inner.pending_input).push_back(data.to_string());
    }

    /// Send new terminal geometry. Silently dropped while disconnected:
    /// geometry is re-established by the caller on reconnect.
    pub fn resize(&self, cols: u16, rows: u16) {
        if self.state() != ConnectionState::Open {
            return;
        }
        send_frame(&self.inner, &ClientMessage::Resize { cols, rows });
    }

    /// Close intentionally: code 1000, forget the session id, and suppress
    /// any scheduled reconnect.
    pub fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        inner
            .reconnect_attempts
            .store(inner.config.max_reconnects, Ordering::SeqCst);
        *lock(&inner.session_id) = None;

        let sender = lock(&inner.outbound).take();
        match sender {
            Some(tx) => {
                let _ = tx.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                })));
            }
            None => {
                *lock(&inner.state) = ConnectionState::ClosedClean;
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.inner.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// The server-assigned session id, once a `session` message arrived.
    pub fn session_id(&self) -> Option<String> {
        lock(&self.inner.session_id).clone()
    }

    /// Number of automatic reconnect attempts made since the last
    /// successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Register a callback for terminal output text.
    pub fn on_data(&self, cb: impl Fn(&str) + Send + Sync + 'static) -> CallbackId {
        let id = self.next_id();
        lock(&self.inner.data_callbacks).push((id, Arc::new(cb)));
        id
    }

    pub fn off_data(&self, id: CallbackId) {
        lock(&self.inner.data_callbacks).retain(|(i, _)| *i != id);
    }

    /// Register a callback fired when the connection opens.
    pub fn on_connect(&self, cb: impl Fn(&ClientEvent) + Send + Sync + 'static) -> CallbackId {
        let id = self.next_id();
        lock(&self.inner.connect_callbacks).push((id, Arc::new(cb)));
        id
    }

    pub fn off_connect(&self, id: CallbackId) {
        lock(&self.inner.connect_callbacks).retain(|(i, _)| *i != id);
    }

    /// Register a callback fired when the connection closes.
    pub fn on_disconnect(&self, cb: impl Fn(&ClientEvent) + Send + Sync + 'static) -> CallbackId {
        let id = self.next_id();
        lock(&self.inner.disconnect_callbacks).push((id, Arc::new(cb)));
        id
    }

    pub fn off_disconnect(&self, id: CallbackId) {
        lock(&self.inner.disconnect_callbacks).retain(|(i, _)| *i != id);
    }

    /// Register a callback for transport faults and server error notices.
    pub fn on_error(&self, cb: impl Fn(&ClientEvent) + Send + Sync + 'static) -> CallbackId {
        let id = self.next_id();
        lock(&self.inner.error_callbacks).push((id, Arc::new(cb)));
        id
    }

    pub fn off_error(&self, id: CallbackId) {
        lock(&self.inner.error_callbacks).retain(|(i, _)| *i != id);
    }

    fn next_id(&self) -> CallbackId {
        self.inner.next_callback_id.fetch_add(1, Ordering::SeqCst)
    }
}

/// Backoff delay before reconnect attempt `attempt` (1-based): the base
/// delay doubled per prior attempt.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

/// Lock a mutex, recovering the guard if a callback panicked while holding it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Encode and enqueue one outbound frame. Returns false when there is no
/// live connection to carry it.
fn send_frame(inner: &Arc<Inner>, msg: &ClientMessage) -> bool {
    let text = match serde_json::to_string(msg) {
        Ok(text) => text,
        Err(e) => {
            dispatch_event(
                &inner.error_callbacks,
                &ClientEvent::Error {
                    message: format!("encode failed: {e}"),
                },
            );
            return true;
        }
    };
    let outbound = lock(&inner.outbound);
    match outbound.as_ref() {
        Some(tx) => tx.send(Message::Text(text)).is_ok(),
        None => false,
    }
}

fn dispatch_data(inner: &Arc<Inner>, data: &str) {
    let callbacks: Vec<DataCallback> = lock(&inner.data_callbacks)
        .iter()
        .map(|(_, cb)| cb.clone())
        .collect();
    for cb in callbacks {
        cb(data);
    }
}

fn dispatch_event(callbacks: &Mutex<Vec<(CallbackId, EventCallback)>>, event: &ClientEvent) {
    let callbacks: Vec<EventCallback> = lock(callbacks).iter().map(|(_, cb)| cb.clone()).collect();
    for cb in callbacks {
        cb(event);
    }
}

/// One connection attempt: dial, relay until close, then classify the close
/// and schedule a reconnect if it was abnormal.
async fn run_connection(inner: Arc<Inner>) {
    let generation = inner.generation.load(Ordering::SeqCst);

    let url = match lock(&inner.session_id).as_ref() {
        Some(id) => format!("{}?sessionId={}", inner.config.endpoint, id),
        None => inner.config.endpoint.clone(),
    };
    debug!(url = %url, "dialing terminal endpoint");

    let ws = match tokio_tungstenite::connect_async(&url).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            *lock(&inner.state) = ConnectionState::ClosedError;
            dispatch_event(
                &inner.error_callbacks,
                &ClientEvent::Error {
                    message: format!("connect failed: {e}"),
                },
            );
            dispatch_event(
                &inner.disconnect_callbacks,
                &ClientEvent::Disconnected {
                    code: CLOSE_ABNORMAL,
                },
            );
            maybe_schedule_reconnect(&inner);
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    *lock(&inner.outbound) = Some(tx);
    *lock(&inner.state) = ConnectionState::Open;
    inner.reconnect_attempts.store(0, Ordering::SeqCst);

    // A disconnect may have raced with the dial. Checked only after the
    // sender is installed: a disconnect that ran during the dial found no
    // sender to close, so its close is issued here instead.
    if inner.generation.load(Ordering::SeqCst) != generation {
        if let Some(tx) = lock(&inner.outbound).take() {
            let _ = tx.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "client disconnect".into(),
            })));
        }
        *lock(&inner.state) = ConnectionState::ClosedClean;
        return;
    }

    // Flush input queued while disconnected, in FIFO order, then announce
    // the open connection.
    flush_pending(&inner);
    let session_id = lock(&inner.session_id).clone();
    dispatch_event(
        &inner.connect_callbacks,
        &ClientEvent::Connected { session_id },
    );

    let mut close_code = CLOSE_ABNORMAL;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_frame(&inner, &text),
            Ok(Message::Binary(data)) => {
                let text = String::from_utf8_lossy(&data).into_owned();
                handle_frame(&inner, &text);
            }
            Ok(Message::Ping(payload)) => {
                if let Some(tx) = lock(&inner.outbound).as_ref() {
                    let _ = tx.send(Message::Pong(payload));
                }
            }
            Ok(Message::Close(frame)) => {
                close_code = frame.map(|f| f.code.into()).unwrap_or(CLOSE_NORMAL);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "socket error");
                dispatch_event(
                    &inner.error_callbacks,
                    &ClientEvent::Error {
                        message: e.to_string(),
                    },
                );
                break;
            }
        }
    }

    *lock(&inner.outbound) = None;
    writer.abort();

    let clean = close_code == CLOSE_NORMAL;
    *lock(&inner.state) = if clean {
        ConnectionState::ClosedClean
    } else {
        ConnectionState::ClosedError
    };
    debug!(code = close_code, clean, "connection closed");
    dispatch_event(
        &inner.disconnect_callbacks,
        &ClientEvent::Disconnected { code: close_code },
    );

    if !clean {
        maybe_schedule_reconnect(&inner);
    }
}

/// Deliver one inbound frame per the lenient decode rules: output and raw
/// payloads go to data callbacks, exits and errors become inline notices.
fn handle_frame(inner: &Arc<Inner>, text: &str) {
    match ServerFrame::decode(text) {
        ServerFrame::Message(ServerMessage::Output { data }) => dispatch_data(inner, &data),
        ServerFrame::Message(ServerMessage::Session { session_id }) => {
            debug!(session_id = %session_id, "session assigned");
            *lock(&inner.session_id) = Some(session_id);
        }
        ServerFrame::Message(ServerMessage::Exit { exit_code, .. }) => {
            dispatch_data(
                inner,
                &format!("\r\n[Process exited with code {exit_code}]\r\n"),
            );
        }
        ServerFrame::Message(ServerMessage::Error { data }) => {
            dispatch_event(
                &inner.error_callbacks,
                &ClientEvent::Error {
                    message: data.clone(),
                },
            );
            dispatch_data(inner, &format!("\r\n[Error: {data}]\r\n"));
        }
        ServerFrame::Raw(text) => dispatch_data(inner, &text),
        ServerFrame::Ignored => {}
    }
}

/// Drain the pending-input queue through the live connection. On a mid-flush
/// failure the unsent remainder stays queued, still in order.
fn flush_pending(inner: &Arc<Inner>) {
    loop {
        let next = lock(&inner.pending_input).pop_front();
        let Some(text) = next else {
            break;
        };
        if !send_frame(inner, &ClientMessage::Input { data: text.clone() }) {
            lock(&inner.pending_input).push_front(text);
            break;
        }
    }
}

/// Schedule the next automatic reconnect, unless the attempt ceiling is
/// reached or a disconnect/manual connect supersedes the timer.
fn maybe_schedule_reconnect(inner: &Arc<Inner>) {
    let attempts = inner.reconnect_attempts.load(Ordering::SeqCst);
    if attempts >= inner.config.max_reconnects {
        debug!(attempts, "reconnect ceiling reached");
        return;
    }
    let attempt = attempts + 1;
    inner.reconnect_attempts.store(attempt, Ordering::SeqCst);

    let delay = backoff_delay(inner.config.base_delay, attempt);
    debug!(attempt, delay_ms = delay.as_millis() as u64, "scheduling reconnect");

    let generation = inner.generation.load(Ordering::SeqCst);
    let inner = inner.clone();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if inner.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        {
            let mut state = lock(&inner.state);
            if matches!(
                *state,
                ConnectionState::Open | ConnectionState::Connecting
            ) {
                return;
            }
            *state = ConnectionState::Connecting;
        }
        run_connection(inner).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_secs(1);
        let delays: Vec<u64> = (1..=5).map(|a| backoff_delay(base, a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
        for pair in delays.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    #[test]
    fn config_defaults() {
        let cfg = ClientConfig::new("ws://localhost:3001/ws/terminal");
        assert_eq!(cfg.max_reconnects, 5);
        assert_eq!(cfg.base_delay, Duration::from_secs(1));
    }

    #[tokio::test]
    async fn starts_idle_and_queues_input() {
        let client = TerminalClient::new(ClientConfig::new("ws://127.0.0.1:1/ws/terminal"));
        assert_eq!(client.state(), ConnectionState::Idle);
        assert!(!client.is_connected());

        client.send("a");
        client.send("b");
        let queued: Vec<String> = lock(&client.inner.pending_input).iter().cloned().collect();
        assert_eq!(queued, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn resize_while_disconnected_is_dropped() {
        let client = TerminalClient::new(ClientConfig::new("ws://127.0.0.1:1/ws/terminal"));
        client.resize(80, 24);
        assert!(lock(&client.inner.pending_input).is_empty());
    }

    #[tokio::test]
    async fn callback_registration_and_removal() {
        let client = TerminalClient::new(ClientConfig::new("ws://127.0.0.1:1/ws/terminal"));
        let id = client.on_data(|_| {});
        assert_eq!(lock(&client.inner.data_callbacks).len(), 1);
        client.off_data(id);
        assert!(lock(&client.inner.data_callbacks).is_empty());
    }

    #[tokio::test]
    async fn exit_and_error_frames_become_inline_notices() {
        let client = TerminalClient::new(ClientConfig::new("ws://127.0.0.1:1/ws/terminal"));
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        client.on_data(move |d| lock(&sink).push(d.to_string()));

        handle_frame(&client.inner, r#"{"type":"exit","exitCode":0}"#);
        handle_frame(&client.inner, r#"{"type":"error","data":"boom"}"#);
        handle_frame(&client.inner, "not json");

        let seen = lock(&seen);
        assert!(seen[0].contains("exited with code 0"));
        assert!(seen[1].contains("[Error: boom]"));
        assert_eq!(seen[2], "not json");
    }

    #[tokio::test]
    async fn session_frame_records_id() {
        let client = TerminalClient::new(ClientConfig::new("ws://127.0.0.1:1/ws/terminal"));
        handle_frame(&client.inner, r#"{"type":"session","sessionId":"abc"}"#);
        assert_eq!(client.session_id().as_deref(), Some("abc"));
    }
}
