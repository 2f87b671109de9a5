//! Connection manager for the companion socket.
//!
//! Owns the single WebSocket connection to the companion process and turns
//! its open/close/error events into an observable [`ConnectionState`].
//!
//! # Lifecycle
//!
//! ```text
//!              connect()                    socket open
//! Disconnected ─────────▶ Connecting ───────────────────▶ Open
//!      ▲                     │  ▲                           │
//!      │        open failed  │  │ retry_delay elapsed       │ close / error
//!      │                     ▼  │                           ▼
//!      └──────────────────  Backoff ◀──────────────── (reconnect loop)
//!                              │
//!                              │ attempts > max_retries
//!                              ▼
//!                      PermanentlyFailed  (until an explicit connect())
//! ```
//!
//! Inbound text frames are decoded at this boundary and handed to a
//! [`FrameHandler`]; malformed frames are logged and dropped here. When the
//! link goes down the handler is told so it can fail every waiter instead of
//! letting them hang until their timeouts.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{decode_frame, encode_frame, ClientMessage, ServerMessage};

/// Observable state of the companion connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Backoff,
    PermanentlyFailed,
}

/// Host and port of the companion's WebSocket server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("127.0.0.1", port)
    }

    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.host.clone(), port)
    }

    pub fn url(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The one reconnection policy: a fixed delay between attempts and a fixed
/// attempt bound.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Automatic reconnect attempts after an unexpected drop.
    pub max_retries: u32,
    /// Delay before each automatic attempt.
    pub retry_delay: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
    /// Delay between open and the initial `REQUEST_FILES`.
    pub settle_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_millis(2000),
            connect_timeout: Duration::from_millis(1000),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// Receives decoded frames and link-loss notifications.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_frame(&self, frame: ServerMessage);
    fn on_connection_lost(&self, reason: &str);
}

/// Handle to the companion connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Link {
    generation: u64,
    out_tx: mpsc::UnboundedSender<Message>,
}

struct Shared {
    policy: RetryPolicy,
    handler: Arc<dyn FrameHandler>,
    endpoint: Mutex<Endpoint>,
    link: Mutex<Option<Link>>,
    state: watch::Sender<ConnectionState>,
    retries: AtomicU32,
    /// Bumped by every open, explicit connect/teardown, and reconnect
    /// schedule. Stale reader tasks and reconnect loops compare against it.
    epoch: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(endpoint: Endpoint, policy: RetryPolicy, handler: Arc<dyn FrameHandler>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                policy,
                handler,
                endpoint: Mutex::new(endpoint),
                link: Mutex::new(None),
                state,
                retries: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        self.shared.endpoint.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.shared.policy
    }

    /// Automatic reconnect attempts made since the last successful open.
    pub fn retry_count(&self) -> u32 {
        self.shared.retries.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Connect to `endpoint`.
    ///
    /// No-op when already open on the same endpoint. A different endpoint
    /// tears the current socket down first. A failed attempt starts the
    /// bounded reconnect loop. Clears `PermanentlyFailed`.
    pub async fn connect(&self, endpoint: Endpoint) -> ConnectionState {
        let shared = &self.shared;
        shared.closed.store(false, Ordering::SeqCst);

        let changed = {
            let mut current = shared.endpoint.lock();
            if *current != endpoint {
                *current = endpoint.clone();
                true
            } else {
                false
            }
        };

        if changed {
            shared.teardown("endpoint changed");
        } else if self.is_open() {
            return ConnectionState::Open;
        }

        shared.epoch.fetch_add(1, Ordering::SeqCst);
        shared.retries.store(0, Ordering::SeqCst);

        match shared.open().await {
            Ok(()) => ConnectionState::Open,
            Err(e) => {
                tracing::warn!(%endpoint, error = %e, "could not connect to companion");
                shared.set_state(ConnectionState::Disconnected);
                shared.schedule_reconnect();
                self.state()
            }
        }
    }

    /// Explicitly reconnect to the current endpoint.
    pub async fn reconnect(&self) -> ConnectionState {
        self.connect(self.endpoint()).await
    }

    /// Check-or-establish before a request.
    ///
    /// Returns `true` at once when open. Otherwise makes one attempt bounded
    /// by the connect timeout and reports whether it succeeded.
    pub async fn ensure_connected(&self) -> bool {
        let shared = &self.shared;
        if self.is_open() {
            return true;
        }
        if shared.closed.load(Ordering::SeqCst) {
            return false;
        }

        let previous = self.state();
        let attempt = tokio::time::timeout(shared.policy.connect_timeout, shared.open()).await;
        match attempt {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "on-demand reconnect failed");
                shared.restore_after_failed_attempt(previous);
                false
            }
            Err(_) => {
                tracing::debug!("on-demand reconnect timed out");
                shared.restore_after_failed_attempt(previous);
                false
            }
        }
    }

    /// Queue a frame on the open socket.
    pub fn send(&self, message: &ClientMessage) -> BridgeResult<()> {
        let text = encode_frame(message)?;
        self.shared.send_text(text, None)
    }

    /// Close the socket without scheduling reconnection. Pending requests
    /// are failed.
    pub fn disconnect(&self) {
        self.shared.teardown("disconnected");
    }

    /// Close for good: no further automatic or on-demand reconnection
    /// until [`connect`](Self::connect) is called again.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.teardown("shutting down");
    }
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "connection state changed");
        }
    }

    fn restore_after_failed_attempt(&self, previous: ConnectionState) {
        if *self.state.borrow() != ConnectionState::Connecting {
            return;
        }
        let restored = match previous {
            ConnectionState::Backoff | ConnectionState::PermanentlyFailed => previous,
            _ => ConnectionState::Disconnected,
        };
        self.set_state(restored);
    }

    fn send_text(&self, text: String, generation: Option<u64>) -> BridgeResult<()> {
        let link = self.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(BridgeError::Connection(
                "no open connection to the companion".to_string(),
            ));
        };
        if generation.is_some_and(|g| g != link.generation) {
            return Err(BridgeError::Connection("connection was replaced".to_string()));
        }
        link.out_tx
            .send(Message::text(text))
            .map_err(|_| BridgeError::Connection("connection closed while sending".to_string()))
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link
            .lock()
            .as_ref()
            .is_some_and(|link| link.generation == generation)
    }

    /// Open the socket and spawn its reader, writer, and settle tasks.
    async fn open(self: &Arc<Self>) -> BridgeResult<()> {
        let _guard = self.connect_lock.lock().await;
        if self.link.lock().is_some() {
            return Ok(());
        }

        let endpoint = self.endpoint.lock().clone();
        self.set_state(ConnectionState::Connecting);

        let url = endpoint.url();
        let (socket, _) = tokio::time::timeout(self.policy.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| BridgeError::Connection(format!("timed out connecting to {}", endpoint)))?
            .map_err(|e| BridgeError::Connection(format!("failed to connect to {}: {}", endpoint, e)))?;

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let generation = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        *self.link.lock() = Some(Link { generation, out_tx });
        self.retries.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Open);
        tracing::info!(%endpoint, "connected to companion");

        let writer = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    writer.link_lost(generation, &format!("send failed: {}", e));
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = Arc::clone(self);
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if !reader.is_current(generation) {
                            break "connection replaced".to_string();
                        }
                        match decode_frame(text.as_str()) {
                            Ok(frame) => reader.handler.on_frame(frame),
                            Err(e) => tracing::warn!(error = %e, "dropping inbound frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break "closed by companion".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("socket error: {}", e),
                }
            };
            reader.link_lost(generation, &reason);
        });

        let settle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(settle.policy.settle_delay).await;
            let sent = encode_frame(&ClientMessage::RequestFiles)
                .and_then(|text| settle.send_text(text, Some(generation)));
            match sent {
                Ok(()) => tracing::debug!("requested workspace file list"),
                Err(e) => tracing::debug!(error = %e, "skipped initial file list request"),
            }
        });

        Ok(())
    }

    /// Called by the reader/writer tasks when their socket dies.
    fn link_lost(self: &Arc<Self>, generation: u64, reason: &str) {
        {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(current) if current.generation == generation => *link = None,
                _ => return,
            }
        }

        tracing::warn!(reason, "connection to companion lost");
        self.set_state(ConnectionState::Disconnected);
        self.handler.on_connection_lost(reason);
        self.schedule_reconnect();
    }

    /// Drop the link on purpose. Stops any running reconnect loop.
    fn teardown(&self, reason: &str) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let had_link = self.link.lock().take().is_some();
        if had_link {
            tracing::info!(reason, "closing companion connection");
        }
        self.set_state(ConnectionState::Disconnected);
        self.handler.on_connection_lost(reason);
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        // Any older loop sees the new epoch on its next wake-up and exits.
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            shared.reconnect_loop(epoch).await;
        });
    }

    fn superseded(&self, epoch: u64) -> bool {
        self.closed.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        loop {
            if self.superseded(epoch) {
                return;
            }

            let attempt = self.retries.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt > self.policy.max_retries {
                self.set_state(ConnectionState::PermanentlyFailed);
                tracing::error!(
                    endpoint = %self.endpoint.lock(),
                    attempts = self.policy.max_retries,
                    "giving up on the companion; reconnect explicitly or change the port"
                );
                return;
            }

            self.set_state(ConnectionState::Backoff);
            tracing::info!(
                attempt,
                max = self.policy.max_retries,
                delay_ms = self.policy.retry_delay.as_millis() as u64,
                "scheduling reconnect"
            );
            tokio::time::sleep(self.policy.retry_delay).await;

            if self.superseded(epoch) {
                return;
            }

            match self.open().await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    // open() moved us to Connecting, but the epoch is unchanged
                    // on failure, so the loop keeps ownership.
                    if self.superseded(epoch) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullHandler;

    impl FrameHandler for NullHandler {
        fn on_frame(&self, _frame: ServerMessage) {}
        fn on_connection_lost(&self, _reason: &str) {}
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_endpoint_url() {
        let endpoint = Endpoint::localhost(49201);
        assert_eq!(endpoint.url(), "ws://127.0.0.1:49201");
        assert_eq!(endpoint.to_string(), "127.0.0.1:49201");
        assert_eq!(endpoint.with_port(50000).port, 50000);
    }

    #[tokio::test]
    async fn test_ensure_connected_fails_without_companion() {
        let manager = ConnectionManager::new(
            Endpoint::localhost(unused_port()),
            RetryPolicy {
                connect_timeout: Duration::from_millis(300),
                ..RetryPolicy::default()
            },
            Arc::new(NullHandler),
        );

        let started = std::time::Instant::now();
        assert!(!manager.ensure_connected().await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.send(&ClientMessage::RequestFiles).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_blocks_on_demand_reconnect() {
        let manager = ConnectionManager::new(
            Endpoint::localhost(unused_port()),
            RetryPolicy::default(),
            Arc::new(NullHandler),
        );
        manager.shutdown();
        assert!(!manager.ensure_connected().await);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
