//! The bridge service: one explicitly constructed instance owning the
//! companion connection, the request multiplexer, the file cache, and the
//! apply orchestrator.
//!
//! ```text
//!  Bridge ──▶ ApplyOrchestrator ──┐
//!    │                            ▼
//!    ├──────▶ FileCache ──▶ Multiplexer ──▶ ConnectionManager ──▶ companion
//!    │                            │
//!    └──────▶ StateStore ◀── FILE_LIST
//! ```
//!
//! Everything the browser layer can ask for goes through the methods here;
//! the HTTP server and the CLI are thin shells around them.

use anyhow::Result;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::apply::{ApplyOrchestrator, ApplyOutcome, ApplyState, Confirm};
use crate::cache::FileCache;
use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState, Endpoint};
use crate::error::BridgeResult;
use crate::multiplexer::Multiplexer;
use crate::predictor::{predict_with_limit, CorpusEntry, SimilarityResult};
use crate::state::StateStore;

/// Handle to the running service. Cheap to clone.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

struct BridgeInner {
    config: Config,
    store: StateStore,
    multiplexer: Multiplexer,
    cache: FileCache,
    orchestrator: ApplyOrchestrator,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

/// Snapshot reported by `cbridge status` and `GET /status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub connection: ConnectionState,
    pub endpoint: Endpoint,
    pub retry_count: u32,
    pub max_retries: u32,
    pub known_files: usize,
    pub cached_files: usize,
    pub pending_requests: usize,
    pub apply: ApplyState,
    pub applies_in_flight: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_apply: Option<ApplyOutcome>,
}

/// Result of [`Bridge::populate_cache`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulateReport {
    pub fetched: usize,
    pub already_cached: usize,
    pub failed: Vec<PopulateFailure>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PopulateFailure {
    pub file_path: String,
    pub error: String,
}

impl Bridge {
    /// Build the service from configuration and persisted state. Does not
    /// connect; call [`start`](Self::start).
    pub fn new(config: Config) -> Result<Self> {
        let store = StateStore::new(config.state.dir.clone());

        let port = match store.load_port() {
            Ok(Some(port)) => port,
            Ok(None) => config.companion.port,
            Err(e) => {
                tracing::warn!(error = %format!("{:#}", e), "ignoring unreadable settings");
                config.companion.port
            }
        };
        let known_files = store.load_files().unwrap_or_else(|e| {
            tracing::warn!(error = %format!("{:#}", e), "ignoring unreadable file list");
            Vec::new()
        });

        let multiplexer = Multiplexer::with_known_files(
            config.endpoint().with_port(port),
            config.retry_policy(),
            config.request_timeouts(),
            known_files,
        );
        let orchestrator =
            ApplyOrchestrator::new(multiplexer.clone(), config.predictor.max_candidates);

        Ok(Self {
            inner: Arc::new(BridgeInner {
                config,
                store,
                multiplexer,
                cache: FileCache::new(),
                orchestrator,
                persist_task: Mutex::new(None),
            }),
        })
    }

    /// Start persisting announced file lists and open the connection.
    pub async fn start(&self) -> ConnectionState {
        self.spawn_file_list_persistence();
        let endpoint = self.connection().endpoint();
        tracing::info!(%endpoint, "starting bridge");
        self.connection().connect(endpoint).await
    }

    pub fn shutdown(&self) {
        self.connection().shutdown();
        if let Some(task) = self.inner.persist_task.lock().take() {
            task.abort();
        }
        tracing::info!("bridge stopped");
    }

    fn spawn_file_list_persistence(&self) {
        let mut task = self.inner.persist_task.lock();
        if task.is_some() {
            return;
        }
        let mut files = self.multiplexer().pending().subscribe_files();
        let store = self.inner.store.clone();
        *task = Some(tokio::spawn(async move {
            while files.changed().await.is_ok() {
                let snapshot = files.borrow_and_update().clone();
                match store.save_files(&snapshot) {
                    Ok(()) => tracing::debug!(count = snapshot.len(), "persisted file list"),
                    Err(e) => {
                        tracing::warn!(error = %format!("{:#}", e), "failed to persist file list")
                    }
                }
            }
        }));
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn connection(&self) -> &ConnectionManager {
        self.inner.multiplexer.connection()
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.inner.multiplexer
    }

    pub fn cache(&self) -> &FileCache {
        &self.inner.cache
    }

    pub fn orchestrator(&self) -> &ApplyOrchestrator {
        &self.inner.orchestrator
    }

    /// Last file list the companion announced (or the persisted one).
    pub fn known_files(&self) -> Vec<String> {
        self.multiplexer().pending().files()
    }

    pub fn status(&self) -> BridgeStatus {
        let connection = self.connection();
        BridgeStatus {
            connection: connection.state(),
            endpoint: connection.endpoint(),
            retry_count: connection.retry_count(),
            max_retries: connection.policy().max_retries,
            known_files: self.known_files().len(),
            cached_files: self.cache().len(),
            pending_requests: self.multiplexer().pending().pending_count(),
            apply: self.orchestrator().state(),
            applies_in_flight: self.orchestrator().in_flight(),
            last_apply: self.orchestrator().last_outcome(),
        }
    }

    /// Ask the companion for a fresh file list.
    pub async fn refresh_files(&self) -> BridgeResult<Vec<String>> {
        self.multiplexer().list_files().await
    }

    /// Known files, requesting a list when none is known yet.
    pub async fn list_files(&self) -> BridgeResult<Vec<String>> {
        let known = self.known_files();
        if !known.is_empty() {
            return Ok(known);
        }
        self.refresh_files().await
    }

    /// Contents of one workspace file, served from the cache when present.
    pub async fn get_file_contents(&self, path: &str) -> BridgeResult<String> {
        if let Some(record) = self.cache().get(path) {
            tracing::debug!(path, "cache hit");
            return Ok(record.content);
        }
        let content = self.multiplexer().fetch_file(path).await?;
        Ok(self.cache().insert(path, content).content)
    }

    /// Fetch every listed path into the cache. Individual failures are
    /// reported, not retried.
    pub async fn populate_cache(&self, paths: Option<Vec<String>>) -> PopulateReport {
        let paths = paths.unwrap_or_else(|| self.known_files());
        let mut report = PopulateReport::default();

        let missing: Vec<String> = paths
            .into_iter()
            .filter(|path| {
                let cached = self.cache().contains(path);
                if cached {
                    report.already_cached += 1;
                }
                !cached
            })
            .collect();

        let fetches = missing.iter().map(|path| async move {
            (path.clone(), self.get_file_contents(path).await)
        });
        for (path, result) in join_all(fetches).await {
            match result {
                Ok(_) => report.fetched += 1,
                Err(e) => report.failed.push(PopulateFailure {
                    file_path: path,
                    error: e.to_string(),
                }),
            }
        }

        tracing::info!(
            fetched = report.fetched,
            cached = report.already_cached,
            failed = report.failed.len(),
            "populated file cache"
        );
        report
    }

    /// Rank candidate destinations for `code`. Without an explicit corpus
    /// the cached files are used.
    pub fn predict_apply_destination(
        &self,
        code: &str,
        corpus: Option<&[CorpusEntry]>,
    ) -> BridgeResult<Vec<SimilarityResult>> {
        let max = self.config().predictor.max_candidates;
        match corpus {
            Some(corpus) => Ok(predict_with_limit(code, corpus, max)?),
            None => Ok(predict_with_limit(code, &self.cache().corpus(), max)?),
        }
    }

    /// Apply `code` to an already chosen destination.
    pub async fn apply_diff(&self, file_name: &str, code: &str) -> BridgeResult<ApplyOutcome> {
        self.orchestrator().apply_to(file_name, code).await
    }

    /// Rank, confirm, and apply `code`. `Ok(None)` when the user declined.
    pub async fn apply_snippet(
        &self,
        code: &str,
        corpus: Option<&[CorpusEntry]>,
        confirmer: &dyn Confirm,
    ) -> BridgeResult<Option<ApplyOutcome>> {
        match corpus {
            Some(corpus) => self.orchestrator().run(code, corpus, confirmer).await,
            None => {
                let corpus = self.cache().corpus();
                self.orchestrator().run(code, &corpus, confirmer).await
            }
        }
    }

    /// The user switched project: forget cached contents and reconnect if
    /// the connection had given up. Returns how many records were dropped.
    pub async fn project_changed(&self) -> usize {
        let cleared = self.cache().clear();
        tracing::info!(cleared, "project changed, cleared file cache");

        match self.connection().state() {
            ConnectionState::PermanentlyFailed | ConnectionState::Disconnected => {
                self.connection().reconnect().await;
            }
            _ => {}
        }
        cleared
    }

    /// Persist a new companion port and reconnect to it.
    pub async fn set_port(&self, port: u16) -> Result<ConnectionState> {
        if port == 0 {
            anyhow::bail!("port must be > 0");
        }
        self.inner.store.save_port(port)?;
        let endpoint = self.connection().endpoint().with_port(port);
        tracing::info!(%endpoint, "companion port changed");
        Ok(self.connection().connect(endpoint).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config;
    use crate::error::{BridgeError, PredictionError};
    use tempfile::TempDir;

    fn bridge_in(dir: &TempDir) -> Bridge {
        let mut config = parse_config("").unwrap();
        config.state.dir = Some(dir.path().to_path_buf());
        Bridge::new(config).unwrap()
    }

    #[test]
    fn test_persisted_port_overrides_config() {
        let tmp = TempDir::new().unwrap();
        StateStore::new(Some(tmp.path().to_path_buf()))
            .save_port(50555)
            .unwrap();

        let bridge = bridge_in(&tmp);
        assert_eq!(bridge.connection().endpoint().port, 50555);
    }

    #[test]
    fn test_persisted_files_are_known_before_connecting() {
        let tmp = TempDir::new().unwrap();
        StateStore::new(Some(tmp.path().to_path_buf()))
            .save_files(&["src/a.js".to_string()])
            .unwrap();

        let bridge = bridge_in(&tmp);
        assert_eq!(bridge.known_files(), vec!["src/a.js"]);
        assert_eq!(bridge.status().known_files, 1);
    }

    #[test]
    fn test_predict_uses_cache_by_default() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge_in(&tmp);

        let err = bridge.predict_apply_destination("let a", None).unwrap_err();
        assert_eq!(err, BridgeError::Prediction(PredictionError::NoCandidates));

        bridge.cache().insert("a.js", "let a = 1;".into());
        let results = bridge.predict_apply_destination("let a", None).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "a.js");
    }

    #[test]
    fn test_explicit_corpus_bypasses_cache() {
        let tmp = TempDir::new().unwrap();
        let bridge = bridge_in(&tmp);
        bridge.cache().insert("cached.js", "let a".into());

        let corpus = [CorpusEntry::new("given.js", "let a")];
        let results = bridge
            .predict_apply_destination("let a", Some(&corpus))
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "given.js");
    }
}
