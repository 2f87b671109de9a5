//! Apply orchestration: pick a destination for a code snippet, confirm it,
//! and ask the companion to apply the change.
//!
//! # State machine
//!
//! ```text
//! Idle ──propose()──▶ AwaitingConfirmation ──cancel()──▶ Idle
//!                            │
//!                            │ apply_to()
//!                            ▼
//!                         Sending ──frame emitted──▶ Pending
//!                                                       │
//!                        ┌──────────────────┬───────────┴──────────┐
//!                        ▼                  ▼                      ▼
//!                    Succeeded            Failed               TimedOut
//!                        └──────────────────┴───────────┬──────────┘
//!                                                       ▼
//!                                                     Idle
//! ```
//!
//! Applies to different destinations run side by side, each with its own
//! state. The published state follows the latest event; once an apply
//! settles it falls back to the newest apply still in flight, or `Idle`
//! when none is left. The result stays available through
//! [`ApplyOrchestrator::last_outcome`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{BridgeError, BridgeResult};
use crate::multiplexer::Multiplexer;
use crate::predictor::{best_match, predict_with_limit, rank, CorpusEntry, SimilarityResult};
use crate::protocol::{workspace_relative, ClientMessage};

// ═══════════════════════════════════════════════════════════════════════
// State
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ApplyState {
    Idle,
    AwaitingConfirmation { default: Option<String> },
    Sending { file: String },
    Pending { file: String },
    Succeeded { file: String },
    Failed { file: String, message: String },
    TimedOut { file: String },
}

impl ApplyState {
    pub fn is_idle(&self) -> bool {
        matches!(self, ApplyState::Idle)
    }
}

/// Result of one finished apply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub file: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Ranked destinations for a snippet, shown to the user for confirmation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub code: String,
    /// Highest score first.
    pub ranked: Vec<SimilarityResult>,
    pub default: Option<String>,
}

/// Asks the user which destination to apply to.
///
/// Returning `None` declines the apply.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, proposal: &Proposal) -> Option<String>;
}

/// Accepts the default destination without asking.
pub struct AcceptDefault;

#[async_trait]
impl Confirm for AcceptDefault {
    async fn confirm(&self, proposal: &Proposal) -> Option<String> {
        proposal.default.clone()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════

pub struct ApplyOrchestrator {
    multiplexer: Multiplexer,
    max_candidates: usize,
    destinations: Arc<Destinations>,
    last_outcome: Mutex<Option<ApplyOutcome>>,
}

/// In-flight destinations and their states, oldest first.
struct Destinations {
    active: Mutex<IndexMap<String, ApplyState>>,
    state: watch::Sender<ApplyState>,
}

impl Destinations {
    fn publish(&self, next: ApplyState) {
        tracing::debug!(state = ?next, "apply state");
        self.state.send_replace(next);
    }

    fn resting(active: &IndexMap<String, ApplyState>) -> ApplyState {
        active
            .last()
            .map_or(ApplyState::Idle, |(_, state)| state.clone())
    }

    fn update(&self, file: &str, next: ApplyState) {
        let mut active = self.active.lock();
        if let Some(slot) = active.get_mut(file) {
            *slot = next.clone();
        }
        self.publish(next);
    }

    /// Drop `file` from the in-flight set, publish `terminal` if given, then
    /// fall back to whatever is still in flight.
    fn release(&self, file: &str, terminal: Option<ApplyState>) {
        let mut active = self.active.lock();
        let was_active = active.shift_remove(file).is_some();
        let settled = terminal.is_some();
        if let Some(terminal) = terminal {
            self.publish(terminal);
        }
        if was_active || settled {
            self.publish(Self::resting(&active));
        }
    }
}

/// Releases a destination when its apply settles or is dropped.
struct InFlight {
    file: String,
    destinations: Arc<Destinations>,
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("file", &self.file).finish_non_exhaustive()
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.destinations.release(&self.file, None);
    }
}

impl ApplyOrchestrator {
    pub fn new(multiplexer: Multiplexer, max_candidates: usize) -> Self {
        let (state, _) = watch::channel(ApplyState::Idle);
        Self {
            multiplexer,
            max_candidates,
            destinations: Arc::new(Destinations {
                active: Mutex::new(IndexMap::new()),
                state,
            }),
            last_outcome: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ApplyState {
        self.destinations.state.borrow().clone()
    }

    /// Destinations with an apply in flight, oldest first.
    pub fn in_flight(&self) -> Vec<String> {
        self.destinations.active.lock().keys().cloned().collect()
    }

    pub fn last_outcome(&self) -> Option<ApplyOutcome> {
        self.last_outcome.lock().clone()
    }

    /// Rank `corpus` against `code` and wait for confirmation.
    pub fn propose(&self, code: &str, corpus: &[CorpusEntry]) -> BridgeResult<Proposal> {
        let scores = predict_with_limit(code, corpus, self.max_candidates)?;
        let default = best_match(&scores).map(|best| best.file_name.clone());
        let proposal = Proposal {
            code: code.to_string(),
            ranked: rank(&scores),
            default: default.clone(),
        };
        self.destinations
            .publish(ApplyState::AwaitingConfirmation { default });
        Ok(proposal)
    }

    /// The user declined the proposal.
    pub fn cancel(&self) {
        if matches!(self.state(), ApplyState::AwaitingConfirmation { .. }) {
            let active = self.destinations.active.lock();
            self.destinations.publish(Destinations::resting(&active));
        }
    }

    /// Send `code` to `file` and wait for the companion's verdict.
    pub async fn apply_to(&self, file: &str, code: &str) -> BridgeResult<ApplyOutcome> {
        let target = workspace_relative(file);
        let _guard = self.claim(&target)?;
        let result = match self
            .multiplexer
            .dispatch(ClientMessage::diff_clipboard(&target, code))
            .await
        {
            Ok(reply) => {
                self.destinations.update(
                    &target,
                    ApplyState::Pending {
                        file: target.clone(),
                    },
                );
                reply.wait().await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        self.settle(&target, result)
    }

    /// Propose, confirm, and apply. `Ok(None)` means the user declined.
    pub async fn run(
        &self,
        code: &str,
        corpus: &[CorpusEntry],
        confirmer: &dyn Confirm,
    ) -> BridgeResult<Option<ApplyOutcome>> {
        let proposal = self.propose(code, corpus)?;
        match confirmer.confirm(&proposal).await {
            Some(file) => self.apply_to(&file, code).await.map(Some),
            None => {
                tracing::info!("apply declined");
                self.cancel();
                Ok(None)
            }
        }
    }

    /// Mark `file` as in flight and publish `Sending` for it.
    fn claim(&self, file: &str) -> BridgeResult<InFlight> {
        let sending = ApplyState::Sending {
            file: file.to_string(),
        };
        let mut active = self.destinations.active.lock();
        if active.contains_key(file) {
            return Err(BridgeError::Busy(file.to_string()));
        }
        active.insert(file.to_string(), sending.clone());
        self.destinations.publish(sending);
        Ok(InFlight {
            file: file.to_string(),
            destinations: Arc::clone(&self.destinations),
        })
    }

    fn settle(&self, file: &str, result: BridgeResult<()>) -> BridgeResult<ApplyOutcome> {
        let (terminal, outcome) = match &result {
            Ok(()) => {
                tracing::info!(file, "change applied");
                (
                    ApplyState::Succeeded {
                        file: file.to_string(),
                    },
                    ApplyOutcome {
                        file: file.to_string(),
                        success: true,
                        error: None,
                        finished_at: Utc::now(),
                    },
                )
            }
            Err(e) => {
                tracing::warn!(file, error = %e, "apply failed");
                let state = if e.is_timeout() {
                    ApplyState::TimedOut {
                        file: file.to_string(),
                    }
                } else {
                    ApplyState::Failed {
                        file: file.to_string(),
                        message: e.to_string(),
                    }
                };
                (
                    state,
                    ApplyOutcome {
                        file: file.to_string(),
                        success: false,
                        error: Some(e.to_string()),
                        finished_at: Utc::now(),
                    },
                )
            }
        };

        *self.last_outcome.lock() = Some(outcome.clone());
        self.destinations.release(file, Some(terminal));
        result.map(|()| outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Endpoint, RetryPolicy};
    use crate::error::PredictionError;
    use crate::multiplexer::RequestTimeouts;
    use std::time::Duration;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn offline_orchestrator() -> ApplyOrchestrator {
        let multiplexer = Multiplexer::new(
            Endpoint::localhost(unused_port()),
            RetryPolicy {
                connect_timeout: Duration::from_millis(200),
                ..RetryPolicy::default()
            },
            RequestTimeouts::default(),
        );
        ApplyOrchestrator::new(multiplexer, 100)
    }

    #[test]
    fn test_propose_ranks_and_picks_default() {
        let orchestrator = offline_orchestrator();
        let corpus = vec![
            CorpusEntry::new("b.js", "import x from 'y'"),
            CorpusEntry::new("a.js", "function add(a,b){return a+b}"),
        ];

        let proposal = orchestrator
            .propose("function add(a,b){return a+b}", &corpus)
            .unwrap();
        assert_eq!(proposal.default.as_deref(), Some("a.js"));
        assert_eq!(proposal.ranked[0].file_name, "a.js");
        assert_eq!(
            orchestrator.state(),
            ApplyState::AwaitingConfirmation {
                default: Some("a.js".into())
            }
        );

        orchestrator.cancel();
        assert!(orchestrator.state().is_idle());
    }

    #[test]
    fn test_propose_without_candidates() {
        let orchestrator = offline_orchestrator();
        let err = orchestrator.propose("let a = 1;", &[]).unwrap_err();
        assert_eq!(err, BridgeError::Prediction(PredictionError::NoCandidates));
        assert!(orchestrator.state().is_idle());
    }

    #[test]
    fn test_claim_rejects_duplicate_destination() {
        let orchestrator = offline_orchestrator();
        let guard = orchestrator.claim("./x.js").unwrap();
        assert_eq!(
            orchestrator.claim("./x.js").unwrap_err(),
            BridgeError::Busy("./x.js".into())
        );
        drop(guard);
        assert!(orchestrator.claim("./x.js").is_ok());
    }

    #[test]
    fn test_settled_apply_falls_back_to_one_still_in_flight() {
        let orchestrator = offline_orchestrator();
        let first = orchestrator.claim("b.js").unwrap();
        let second = orchestrator.claim("a.js").unwrap();
        for file in ["b.js", "a.js"] {
            orchestrator.destinations.update(
                file,
                ApplyState::Pending {
                    file: file.to_string(),
                },
            );
        }

        orchestrator.settle("a.js", Ok(())).unwrap();
        drop(second);
        assert_eq!(
            orchestrator.state(),
            ApplyState::Pending {
                file: "b.js".into()
            }
        );
        assert_eq!(orchestrator.in_flight(), vec!["b.js".to_string()]);

        drop(first);
        assert!(orchestrator.state().is_idle());
        assert!(orchestrator.in_flight().is_empty());
    }

    #[tokio::test]
    async fn test_offline_apply_fails_and_returns_to_idle() {
        let orchestrator = offline_orchestrator();
        let err = orchestrator.apply_to("/src/x.js", "code").await.unwrap_err();
        assert!(matches!(err, BridgeError::Connection(_)));
        assert!(orchestrator.state().is_idle());

        let outcome = orchestrator.last_outcome().unwrap();
        assert_eq!(outcome.file, "./src/x.js");
        assert!(!outcome.success);
    }

    struct Decline;

    #[async_trait]
    impl Confirm for Decline {
        async fn confirm(&self, _proposal: &Proposal) -> Option<String> {
            None
        }
    }

    #[tokio::test]
    async fn test_declined_run_sends_nothing() {
        let orchestrator = offline_orchestrator();
        let corpus = vec![CorpusEntry::new("a.js", "let a = 1;")];
        let result = orchestrator.run("let a", &corpus, &Decline).await.unwrap();
        assert!(result.is_none());
        assert!(orchestrator.state().is_idle());
        assert!(orchestrator.last_outcome().is_none());
    }
}
