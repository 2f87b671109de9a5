//! Request/response correlation over the companion socket.
//!
//! The socket carries no request ids: replies arrive asynchronously, in any
//! order, and are matched to callers by `(request kind, correlation key)`.
//! Each kind has its own key→waiters map, so fetching and applying the same
//! path never collide.
//!
//! # Duplicate keys
//!
//! | Kind | Second request for a key already in flight |
//! |------|---------------------------------------------|
//! | `REQUEST_FILES` | joins the in-flight request, no new frame |
//! | `GET_FILE_CONTENTS` | joins the in-flight request, no new frame |
//! | `DIFF_CLIPBOARD` | queued; replies resolve waiters oldest first |
//!
//! Every waiter is settled exactly once: by its reply, by its timeout, or by
//! a forced [`BridgeError::Connection`] when the link drops.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};

use crate::connection::{ConnectionManager, Endpoint, FrameHandler, RetryPolicy};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{ClientMessage, RequestKind, ServerMessage};

/// Per-kind reply bounds.
#[derive(Debug, Clone)]
pub struct RequestTimeouts {
    pub file_list: Duration,
    pub file_contents: Duration,
    pub diff_apply: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            file_list: Duration::from_secs(10),
            file_contents: Duration::from_secs(10),
            diff_apply: Duration::from_secs(120),
        }
    }
}

impl RequestTimeouts {
    pub fn for_kind(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::FileList => self.file_list,
            RequestKind::FileContents => self.file_contents,
            RequestKind::DiffApply => self.diff_apply,
        }
    }
}

type Waiter = oneshot::Sender<BridgeResult<ServerMessage>>;

struct PendingEntry {
    id: u64,
    /// This entry's caller wrote the frame the queue is waiting on.
    emitted: bool,
    tx: Waiter,
}

type KeyMap = HashMap<String, VecDeque<PendingEntry>>;

/// Live waiters, grouped by kind and key. Also publishes the latest
/// `FILE_LIST` the companion sent.
pub struct PendingTable {
    maps: Mutex<HashMap<RequestKind, KeyMap>>,
    next_id: AtomicU64,
    files: watch::Sender<Vec<String>>,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl PendingTable {
    pub fn new(known_files: Vec<String>) -> Self {
        let (files, _) = watch::channel(known_files);
        Self {
            maps: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            files,
        }
    }

    /// Register a waiter. The returned flag is `true` when the caller must
    /// emit the frame, `false` when it joined a request already in flight.
    ///
    /// A coalescing key whose emitting waiter has timed out counts as idle:
    /// the next caller sends a fresh frame.
    fn register(
        &self,
        kind: RequestKind,
        key: &str,
    ) -> (u64, oneshot::Receiver<BridgeResult<ServerMessage>>, bool) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();

        let mut maps = self.maps.lock();
        let queue = maps
            .entry(kind)
            .or_default()
            .entry(key.to_string())
            .or_default();
        let emit = match kind {
            RequestKind::DiffApply => true,
            RequestKind::FileList | RequestKind::FileContents => {
                !queue.iter().any(|entry| entry.emitted)
            }
        };
        queue.push_back(PendingEntry {
            id,
            emitted: emit,
            tx,
        });
        (id, rx, emit)
    }

    /// Drop one waiter (after its timeout). Returns whether it was still live.
    fn remove(&self, kind: RequestKind, key: &str, id: u64) -> bool {
        let mut maps = self.maps.lock();
        let Some(by_key) = maps.get_mut(&kind) else {
            return false;
        };
        let Some(queue) = by_key.get_mut(key) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|entry| entry.id != id);
        let removed = queue.len() != before;
        if queue.is_empty() {
            by_key.remove(key);
        }
        removed
    }

    /// Fail every waiter on one key.
    fn fail_key(&self, kind: RequestKind, key: &str, error: BridgeError) {
        let waiters = self
            .maps
            .lock()
            .get_mut(&kind)
            .and_then(|by_key| by_key.remove(key))
            .unwrap_or_default();
        for entry in waiters {
            let _ = entry.tx.send(Err(error.clone()));
        }
    }

    /// Fail every live waiter. Returns how many were failed.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut maps = self.maps.lock();
            maps.drain()
                .flat_map(|(_, by_key)| by_key.into_values())
                .flatten()
                .collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(error.clone()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.maps
            .lock()
            .values()
            .flat_map(|by_key| by_key.values())
            .map(VecDeque::len)
            .sum()
    }

    pub fn pending_for(&self, kind: RequestKind, key: &str) -> usize {
        self.maps
            .lock()
            .get(&kind)
            .and_then(|by_key| by_key.get(key))
            .map_or(0, VecDeque::len)
    }

    /// Latest workspace file list announced by the companion.
    pub fn files(&self) -> Vec<String> {
        self.files.borrow().clone()
    }

    pub fn subscribe_files(&self) -> watch::Receiver<Vec<String>> {
        self.files.subscribe()
    }

    /// Route one inbound frame. Returns `false` when nothing was waiting
    /// for it and it carried nothing else worth keeping.
    pub fn dispatch(&self, frame: ServerMessage) -> bool {
        let mut consumed = false;
        if let ServerMessage::FileList { files } = &frame {
            tracing::debug!(count = files.len(), "received workspace file list");
            self.files.send_replace(files.clone());
            consumed = true;
        }

        let correlation = frame
            .correlation()
            .map(|(kind, key)| (kind, key.to_string()));
        let Some((kind, key)) = correlation else {
            return self.dispatch_keyless(frame);
        };

        let waiters: Vec<PendingEntry> = {
            let mut maps = self.maps.lock();
            let Some(by_key) = maps.get_mut(&kind) else {
                return self.unmatched(&frame, &key, consumed);
            };
            take_waiters(by_key, kind, &key)
        };

        if waiters.is_empty() {
            return self.unmatched(&frame, &key, consumed);
        }

        let outcome = reply_outcome(frame);
        for entry in waiters {
            let _ = entry.tx.send(outcome.clone());
        }
        true
    }

    fn unmatched(&self, frame: &ServerMessage, key: &str, consumed: bool) -> bool {
        if !consumed {
            tracing::warn!(frame = frame.type_name(), key, "dropping unmatched reply");
        }
        consumed
    }

    /// A keyless `ERROR` is attributed by its text first: apply and read
    /// failures go to the only pending request of that kind. Any other
    /// message needs exactly one request outstanding.
    fn dispatch_keyless(&self, frame: ServerMessage) -> bool {
        let ServerMessage::Error { error, .. } = frame else {
            return false;
        };
        let hint = keyless_error_kind(&error);

        let target = {
            let mut maps = self.maps.lock();
            let live: Vec<(RequestKind, String)> = maps
                .iter()
                .filter(|(kind, _)| hint.map_or(true, |hinted| hinted == **kind))
                .flat_map(|(kind, by_key)| {
                    by_key
                        .iter()
                        .filter(|(_, queue)| !queue.is_empty())
                        .map(move |(key, _)| (*kind, key.clone()))
                })
                .collect();
            match live.as_slice() {
                [(kind, key)] => {
                    let entries = maps
                        .get_mut(kind)
                        .map(|by_key| take_waiters(by_key, *kind, key))
                        .unwrap_or_default();
                    Some((*kind, key.clone(), entries))
                }
                _ => None,
            }
        };

        match target {
            Some((kind, key, entries)) => {
                tracing::warn!(%kind, key = %key, error = %error, "companion reported an error");
                let failure = match kind {
                    RequestKind::DiffApply => BridgeError::Apply {
                        file: key.clone(),
                        message: error,
                    },
                    _ => BridgeError::Server(error),
                };
                for entry in entries {
                    let _ = entry.tx.send(Err(failure.clone()));
                }
                true
            }
            None => {
                tracing::warn!(error = %error, "companion error could not be attributed to a request");
                false
            }
        }
    }
}

/// Waiters a reply for `key` settles: the oldest apply, or every joined
/// fetch and list request.
fn take_waiters(by_key: &mut KeyMap, kind: RequestKind, key: &str) -> Vec<PendingEntry> {
    let Some(queue) = by_key.get_mut(key) else {
        return Vec::new();
    };
    let taken = match kind {
        RequestKind::DiffApply => queue.pop_front().into_iter().collect(),
        RequestKind::FileList | RequestKind::FileContents => queue.drain(..).collect(),
    };
    if queue.is_empty() {
        by_key.remove(key);
    }
    taken
}

/// The request family a keyless companion error names, if any.
fn keyless_error_kind(error: &str) -> Option<RequestKind> {
    if error.starts_with("Failed to handle clipboard diff") {
        Some(RequestKind::DiffApply)
    } else if error.starts_with("Failed to read file") {
        Some(RequestKind::FileContents)
    } else {
        None
    }
}

/// Turn a correlated reply into the waiter's result.
fn reply_outcome(frame: ServerMessage) -> BridgeResult<ServerMessage> {
    match frame {
        ServerMessage::DiffClipboardResult {
            file_name,
            success,
            error,
        } if !success || error.is_some() => Err(BridgeError::Apply {
            file: file_name,
            message: error.unwrap_or_else(|| "companion reported failure".to_string()),
        }),
        ServerMessage::Error {
            error,
            file_name: Some(file_name),
            file_path: None,
        } => Err(BridgeError::Apply {
            file: file_name,
            message: error,
        }),
        ServerMessage::Error { error, .. } => Err(BridgeError::Server(error)),
        other => Ok(other),
    }
}

impl FrameHandler for PendingTable {
    fn on_frame(&self, frame: ServerMessage) {
        self.dispatch(frame);
    }

    fn on_connection_lost(&self, reason: &str) {
        let failed = self.fail_all(BridgeError::Connection(format!("connection lost: {}", reason)));
        if failed > 0 {
            tracing::warn!(failed, reason, "failed pending requests after connection loss");
        }
    }
}

/// A registered request whose frame has been emitted.
pub struct PendingReply {
    kind: RequestKind,
    key: String,
    id: u64,
    timeout: Duration,
    rx: oneshot::Receiver<BridgeResult<ServerMessage>>,
    pending: Arc<PendingTable>,
}

impl PendingReply {
    /// Wait for the correlated reply, bounded by the kind's timeout.
    pub async fn wait(self) -> BridgeResult<ServerMessage> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::Connection(
                "request dropped before a reply arrived".to_string(),
            )),
            Err(_) => {
                self.pending.remove(self.kind, &self.key, self.id);
                tracing::warn!(kind = %self.kind, key = %self.key, "request timed out");
                Err(BridgeError::Timeout {
                    kind: self.kind,
                    key: self.key,
                    after: self.timeout,
                })
            }
        }
    }
}

/// Request/response front end over the [`ConnectionManager`].
#[derive(Clone)]
pub struct Multiplexer {
    connection: ConnectionManager,
    pending: Arc<PendingTable>,
    timeouts: RequestTimeouts,
}

impl Multiplexer {
    pub fn new(endpoint: Endpoint, policy: RetryPolicy, timeouts: RequestTimeouts) -> Self {
        Self::with_known_files(endpoint, policy, timeouts, Vec::new())
    }

    pub fn with_known_files(
        endpoint: Endpoint,
        policy: RetryPolicy,
        timeouts: RequestTimeouts,
        known_files: Vec<String>,
    ) -> Self {
        let pending = Arc::new(PendingTable::new(known_files));
        let handler: Arc<dyn FrameHandler> = pending.clone();
        let connection = ConnectionManager::new(endpoint, policy, handler);
        Self {
            connection,
            pending,
            timeouts,
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    pub fn timeouts(&self) -> &RequestTimeouts {
        &self.timeouts
    }

    /// Register and emit a request without waiting for its reply.
    pub async fn dispatch(&self, request: ClientMessage) -> BridgeResult<PendingReply> {
        if !self.connection.ensure_connected().await {
            return Err(BridgeError::Connection(format!(
                "companion at {} is unreachable",
                self.connection.endpoint()
            )));
        }

        let kind = request.kind();
        let key = request.key().to_string();
        let (id, rx, emit) = self.pending.register(kind, &key);

        if emit {
            if let Err(e) = self.connection.send(&request) {
                self.pending.fail_key(kind, &key, e.clone());
                return Err(e);
            }
            tracing::debug!(%kind, key = %key, "request sent");
        } else {
            tracing::debug!(%kind, key = %key, "joined in-flight request");
        }

        Ok(PendingReply {
            kind,
            key,
            id,
            timeout: self.timeouts.for_kind(kind),
            rx,
            pending: Arc::clone(&self.pending),
        })
    }

    /// Send a request and wait for its correlated reply.
    pub async fn send(&self, request: ClientMessage) -> BridgeResult<ServerMessage> {
        self.dispatch(request).await?.wait().await
    }

    pub async fn list_files(&self) -> BridgeResult<Vec<String>> {
        match self.send(ClientMessage::RequestFiles).await? {
            ServerMessage::FileList { files } => Ok(files),
            other => Err(unexpected_reply(RequestKind::FileList, &other)),
        }
    }

    pub async fn fetch_file(&self, path: &str) -> BridgeResult<String> {
        match self.send(ClientMessage::get_file_contents(path)).await? {
            ServerMessage::FileContents { content, .. } => Ok(content),
            other => Err(unexpected_reply(RequestKind::FileContents, &other)),
        }
    }
}

fn unexpected_reply(kind: RequestKind, frame: &ServerMessage) -> BridgeError {
    BridgeError::Protocol(format!(
        "unexpected {} reply to {}",
        frame.type_name(),
        kind
    ))
}
