//! A scriptable stand-in for the editor companion.
//!
//! Accepts WebSocket connections on a local port, records every frame it
//! receives, and answers through a caller-supplied responder.

#![allow(dead_code)]

use code_bridge::config::{parse_config, Config};
use code_bridge::connection::ConnectionState;
use code_bridge::Bridge;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub type Responder = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;

pub struct MockCompanion {
    pub port: u16,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    push: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
    accept: JoinHandle<()>,
}

#[derive(Clone)]
struct ConnectionCtx {
    responder: Responder,
    delay: Duration,
    received: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    push: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
}

impl MockCompanion {
    pub async fn start(responder: Responder) -> Self {
        Self::start_on(0, responder, Duration::ZERO).await
    }

    pub async fn start_delayed(responder: Responder, delay: Duration) -> Self {
        Self::start_on(0, responder, delay).await
    }

    pub async fn start_on(port: u16, responder: Responder, delay: Duration) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let (push, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let ctx = ConnectionCtx {
            responder,
            delay,
            received: Arc::new(Mutex::new(Vec::new())),
            connections: Arc::new(AtomicUsize::new(0)),
            push: push.clone(),
            kill: kill.clone(),
        };

        let received = Arc::clone(&ctx.received);
        let connections = Arc::clone(&ctx.connections);
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, ctx.clone()));
            }
        });

        Self {
            port,
            received,
            connections,
            push,
            kill,
            accept,
        }
    }

    /// Every frame received so far, across all connections.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().clone()
    }

    pub fn received_of(&self, frame_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|frame| frame["type"] == frame_type)
            .collect()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Send an unsolicited frame on every open connection.
    pub fn push(&self, frame: Value) {
        let _ = self.push.send(frame.to_string());
    }

    /// Drop every open connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.kill.send(());
    }

    /// Stop listening and drop every connection.
    pub async fn stop(self) {
        self.drop_connections();
        self.accept.abort();
        let _ = self.accept.await;
    }
}

async fn serve_connection(stream: TcpStream, ctx: ConnectionCtx) {
    let Ok(ws) = accept_async(stream).await else {
        return;
    };
    ctx.connections.fetch_add(1, Ordering::SeqCst);
    let (mut sink, mut source) = ws.split();
    let mut push_rx = ctx.push.subscribe();
    let mut kill_rx = ctx.kill.subscribe();

    loop {
        tokio::select! {
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    ctx.received.lock().push(frame.clone());
                    let replies = (ctx.responder)(&frame);
                    if !replies.is_empty() && !ctx.delay.is_zero() {
                        tokio::time::sleep(ctx.delay).await;
                    }
                    for reply in replies {
                        if sink.send(Message::text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            pushed = push_rx.recv() => {
                if let Ok(text) = pushed {
                    let _ = sink.send(Message::text(text)).await;
                }
            }
            _ = kill_rx.recv() => break,
        }
    }
}

// ============ Responders ============

/// Answers like a companion with an open workspace holding `files`.
///
/// Unknown paths get the keyless `ERROR` a real companion sends when a read
/// fails; every apply succeeds.
pub fn workspace(files: &[(&str, &str)]) -> Responder {
    let files: Vec<(String, String)> = files
        .iter()
        .map(|(path, content)| (path.to_string(), content.to_string()))
        .collect();
    Arc::new(move |frame: &Value| match frame["type"].as_str() {
        Some("REQUEST_FILES") => vec![json!({
            "type": "FILE_LIST",
            "files": files.iter().map(|(path, _)| path.clone()).collect::<Vec<_>>(),
        })],
        Some("GET_FILE_CONTENTS") => {
            let path = frame["filePath"].as_str().unwrap_or_default();
            match files.iter().find(|(p, _)| p == path) {
                Some((_, content)) => vec![json!({
                    "type": "FILE_CONTENTS",
                    "filePath": path,
                    "content": content,
                })],
                None => vec![json!({ "type": "ERROR", "error": "Failed to read file" })],
            }
        }
        Some("DIFF_CLIPBOARD") => vec![json!({
            "type": "DIFF_CLIPBOARD_RESULT",
            "fileName": frame["fileName"],
            "success": true,
        })],
        _ => Vec::new(),
    })
}

/// Records frames and never answers.
pub fn silent() -> Responder {
    Arc::new(|_: &Value| Vec::new())
}

// ============ Bridge helpers ============

/// Config pointed at `port` with fast retry timings and state under `dir`.
pub fn fast_config(port: u16, dir: &Path) -> Config {
    let mut config = parse_config(
        r#"
[connection]
max_retries = 5
retry_delay_ms = 100
connect_timeout_ms = 500
settle_delay_ms = 50

[requests]
file_timeout_secs = 5
apply_timeout_secs = 5
list_timeout_secs = 5
"#,
    )
    .unwrap();
    config.companion.port = port;
    config.state.dir = Some(dir.to_path_buf());
    config
}

pub async fn started_bridge(config: Config) -> Bridge {
    let bridge = Bridge::new(config).unwrap();
    bridge.start().await;
    bridge
}

pub async fn wait_for_state(bridge: &Bridge, target: ConnectionState, within: Duration) -> bool {
    let mut rx = bridge.connection().subscribe();
    let reached = tokio::time::timeout(within, rx.wait_for(|state| *state == target))
        .await
        .is_ok_and(|res| res.is_ok());
    reached
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}
