//! End-to-end tests for the terminal gateway over a real WebSocket, using a
//! scripted process factory in place of the OS PTY so behavior is
//! deterministic.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use webterm_client::{ClientConfig, ClientEvent, ConnectionState, LineBuffer, TerminalClient};
use webterm_core::{ExitStatus, ServerMessage, TermError, TermResult};
use webterm_server::config::ServerConfig;
use webterm_server::pty::{ProcessControl, ProcessHandle, PtyFactory};
use webterm_server::registry::SessionRegistry;
use webterm_server::server::TerminalServer;

/// One scripted process: echoes every input chunk back as output, records
/// inputs and resizes, and exits only when told to.
struct Probe {
    inputs: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    kills: AtomicUsize,
    exit_tx: Mutex<Option<oneshot::Sender<ExitStatus>>>,
    output_tx: mpsc::Sender<Vec<u8>>,
}

impl Probe {
    fn trigger_exit(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(ExitStatus { code, signal: None });
        }
    }

    async fn emit(&self, bytes: &[u8]) {
        let _ = self.output_tx.send(bytes.to_vec()).await;
    }

    fn inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().unwrap().clone()
    }

    fn resizes(&self) -> Vec<(u16, u16)> {
        self.resizes.lock().unwrap().clone()
    }
}

impl ProcessControl for Probe {
    fn resize(&self, cols: u16, rows: u16) {
        self.resizes.lock().unwrap().push((cols, rows));
    }

    fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

struct ScriptedFactory {
    fail: bool,
    probes: Mutex<Vec<Arc<Probe>>>,
}

impl ScriptedFactory {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            probes: Mutex::new(Vec::new()),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            probes: Mutex::new(Vec::new()),
        })
    }

    fn probe(&self, index: usize) -> Option<Arc<Probe>> {
        self.probes.lock().unwrap().get(index).cloned()
    }
}

impl PtyFactory for ScriptedFactory {
    fn spawn(&self) -> TermResult<ProcessHandle> {
        if self.fail {
            return Err(TermError::PtyUnavailable("no PTY in test".to_string()));
        }

        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(64);
        let (exit_tx, exit_rx) = oneshot::channel::<ExitStatus>();

        let probe = Arc::new(Probe {
            inputs: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            exit_tx: Mutex::new(Some(exit_tx)),
            output_tx: output_tx.clone(),
        });
        self.probes.lock().unwrap().push(probe.clone());

        let echo = probe.clone();
        tokio::spawn(async move {
            while let Some(bytes) = input_rx.recv().await {
                echo.inputs.lock().unwrap().push(bytes.clone());
                if output_tx.send(bytes).await.is_err() {
                    break;
                }
            }
        });

        Ok(ProcessHandle {
            input: input_tx,
            output: output_rx,
            exit: exit_rx,
            control: probe,
        })
    }
}

async fn start_server(factory: Arc<ScriptedFactory>) -> (SocketAddr, Arc<SessionRegistry>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        port: 0,
        shell: "/bin/sh".to_string(),
        workspace: std::env::temp_dir(),
        max_sessions: 100,
    };
    let server = TerminalServer::new(config, factory);
    let registry = server.registry();
    tokio::spawn(async move {
        let _ = server.run_on(listener).await;
    });
    (addr, registry)
}

fn test_client(addr: SocketAddr) -> TerminalClient {
    TerminalClient::new(ClientConfig {
        endpoint: format!("ws://{addr}/ws/terminal"),
        base_delay: Duration::from_millis(10),
        max_reconnects: 5,
    })
}

async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn session_is_assigned_and_resize_reaches_the_process() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;

    let client = test_client(addr);
    client.connect_with("fixed-id");
    wait_for("open", || client.is_connected()).await;

    // The requested id is echoed back as the session id.
    assert_eq!(client.session_id().as_deref(), Some("fixed-id"));

    client.resize(120, 40);
    let probe = factory.probe(0).unwrap();
    wait_for("resize recorded", || {
        probe.resizes().contains(&(120, 40))
    })
    .await;

    client.disconnect();

    // Without a requested id the server generates a hex one.
    let anon = test_client(addr);
    anon.connect();
    wait_for("anon session assigned", || anon.session_id().is_some()).await;
    let id = anon.session_id().unwrap();
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    anon.disconnect();
}

#[tokio::test]
async fn echoed_output_reaches_data_callbacks() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;

    let client = test_client(addr);
    let buffer = Arc::new(Mutex::new(LineBuffer::new()));
    let sink = buffer.clone();
    client.on_data(move |data| sink.lock().unwrap().push(data));

    client.connect();
    wait_for("open", || client.is_connected()).await;

    client.send("echo hello\n");
    wait_for("echo arrives", || {
        buffer.lock().unwrap().contains("echo hello")
    })
    .await;

    // Server-initiated output also flows without input.
    factory.probe(0).unwrap().emit(b"spontaneous\n").await;
    wait_for("spontaneous output", || {
        buffer.lock().unwrap().contains("spontaneous")
    })
    .await;

    client.disconnect();
}

#[tokio::test]
async fn exit_produces_notice_clean_close_and_single_kill() {
    let factory = ScriptedFactory::new();
    let (addr, registry) = start_server(factory.clone()).await;

    let client = test_client(addr);
    let buffer = Arc::new(Mutex::new(LineBuffer::new()));
    let sink = buffer.clone();
    client.on_data(move |data| sink.lock().unwrap().push(data));

    client.connect();
    wait_for("open", || client.is_connected()).await;

    let probe = factory.probe(0).unwrap();
    probe.trigger_exit(3);

    wait_for("exit notice", || {
        buffer.lock().unwrap().contains("[Process exited with code 3]")
    })
    .await;
    wait_for("clean close", || {
        client.state() == ConnectionState::ClosedClean
    })
    .await;

    // Clean close: no reconnect, and teardown killed exactly once.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.reconnect_attempts(), 0);
    assert_eq!(probe.kills.load(Ordering::SeqCst), 1);
    assert_eq!(registry.count().await, 0);
}

#[tokio::test]
async fn output_emitted_before_exit_is_not_dropped() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;

    // Enqueue a final chunk and the exit status back to back, so the relay
    // can see both ready in the same poll.
    for i in 0..10 {
        let client = test_client(addr);
        let buffer = Arc::new(Mutex::new(LineBuffer::new()));
        let sink = buffer.clone();
        client.on_data(move |data| sink.lock().unwrap().push(data));

        client.connect();
        wait_for("open", || client.is_connected()).await;

        let probe = factory.probe(i).unwrap();
        probe.emit(b"tail-marker\n").await;
        probe.trigger_exit(0);

        wait_for("exit notice", || {
            buffer.lock().unwrap().contains("exited with code 0")
        })
        .await;
        assert!(
            buffer.lock().unwrap().contains("tail-marker"),
            "final output chunk lost on connection {i}"
        );
    }
}

#[tokio::test]
async fn disconnect_racing_connect_never_leaves_a_live_connection() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;

    let mut clients = Vec::new();
    for i in 0..20 {
        let client = test_client(addr);
        client.connect();
        // Vary the window between the dial and the disconnect.
        if i % 2 == 0 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        client.disconnect();
        clients.push(client);
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    for (i, client) in clients.iter().enumerate() {
        assert_ne!(
            client.state(),
            ConnectionState::Open,
            "disconnect was lost on client {i}"
        );
    }
}

#[tokio::test]
async fn spawn_failure_reports_unavailable_and_closes_clean() {
    let factory = ScriptedFactory::failing();
    let (addr, _registry) = start_server(factory).await;

    let client = test_client(addr);
    let errors = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = errors.clone();
    client.on_error(move |event| {
        if let ClientEvent::Error { message } = event {
            sink.lock().unwrap().push(message.clone());
        }
    });

    client.connect();
    wait_for("unavailable notice", || {
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.contains("Terminal not available on this server"))
    })
    .await;
    wait_for("clean close", || {
        client.state() == ConnectionState::ClosedClean
    })
    .await;

    // The clean close must not trigger the reconnect loop.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(client.reconnect_attempts(), 0);
}

#[tokio::test]
async fn queued_input_is_flushed_in_order_exactly_once() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;

    let client = test_client(addr);
    client.send("a");
    client.send("b");

    client.connect();
    wait_for("queued input delivered", || {
        factory.probe(0).map_or(false, |p| p.inputs().len() >= 2)
    })
    .await;

    let probe = factory.probe(0).unwrap();
    assert_eq!(probe.inputs(), vec![b"a".to_vec(), b"b".to_vec()]);

    // No duplicate delivery afterwards.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(probe.inputs().len(), 2);

    client.disconnect();
}

#[tokio::test]
async fn reconnect_stops_at_the_ceiling() {
    // A listener that accepts and immediately drops every connection, so
    // each dial fails at the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = dials.clone();
    tokio::spawn(async move {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(stream);
            }
        }
    });

    let client = test_client(addr);
    client.connect();

    // Initial dial plus five backoff retries.
    wait_for("six dials", || dials.load(Ordering::SeqCst) >= 6).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(dials.load(Ordering::SeqCst), 6);
    assert_eq!(client.reconnect_attempts(), 5);
    assert_eq!(client.state(), ConnectionState::ClosedError);

    // A manual connect is still allowed after the ceiling.
    client.connect();
    wait_for("manual dial", || dials.load(Ordering::SeqCst) >= 7).await;
}

#[tokio::test]
async fn duplicate_session_id_is_rejected() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory.clone()).await;
    let url = format!("ws://{addr}/ws/terminal?sessionId=dup");

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let frame = first.next().await.unwrap().unwrap();
    let msg: ServerMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert!(matches!(msg, ServerMessage::Session { session_id } if session_id == "dup"));

    // Second binding of the same id gets an error and a close, and its
    // freshly spawned process is killed.
    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let mut rejected = false;
    while let Some(Ok(frame)) = second.next().await {
        if let Ok(text) = frame.to_text() {
            if let Ok(ServerMessage::Error { data }) = serde_json::from_str(text) {
                assert!(data.contains("already bound"));
                rejected = true;
                break;
            }
        }
    }
    assert!(rejected, "expected an error frame on the second connection");

    let second_probe = factory.probe(1).unwrap();
    wait_for("rejected process killed", || {
        second_probe.kills.load(Ordering::SeqCst) == 1
    })
    .await;

    // The first session is unaffected.
    first.send(tokio_tungstenite::tungstenite::Message::Text(
        r#"{"type":"input","data":"still here"}"#.to_string(),
    ))
    .await
    .unwrap();
    let probe = factory.probe(0).unwrap();
    wait_for("first session still relays", || {
        probe.inputs().iter().any(|i| i == b"still here")
    })
    .await;
}

#[tokio::test]
async fn non_terminal_paths_are_rejected() {
    let factory = ScriptedFactory::new();
    let (addr, _registry) = start_server(factory).await;

    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/other")).await;
    assert!(result.is_err());
}
