//! Error taxonomy for the command channel, predictor, and apply flow.
//!
//! Every failure in the core degrades exactly one in-flight operation, so
//! each variant carries enough context to be shown to the user as-is.

use std::time::Duration;
use thiserror::Error;

use crate::protocol::RequestKind;

/// Errors surfaced by [`Bridge`](crate::bridge::Bridge) operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BridgeError {
    /// The socket is not open and could not be re-established in time,
    /// reconnection is exhausted, or the connection dropped mid-request.
    #[error("not connected: {0}")]
    Connection(String),

    /// No correlated reply arrived within the per-kind bound.
    #[error("{kind} request for '{key}' timed out after {}s", .after.as_secs_f64())]
    Timeout {
        kind: RequestKind,
        key: String,
        after: Duration,
    },

    /// A frame could not be decoded or did not fit the request it answered.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Prediction(#[from] PredictionError),

    /// The companion reported that applying the change failed.
    #[error("apply to '{file}' failed: {message}")]
    Apply { file: String, message: String },

    /// The companion answered with an `ERROR` frame (e.g. no workspace open).
    #[error("companion error: {0}")]
    Server(String),

    /// An apply is already pending for this destination.
    #[error("an apply to '{0}' is already pending")]
    Busy(String),
}

/// Distinguishable failures of [`predict`](crate::predictor::predict).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PredictionError {
    #[error("no snippet provided")]
    NoSnippet,
    #[error("no files available for matching")]
    NoCandidates,
    #[error("matching failed: {0}")]
    Failed(String),
}

impl BridgeError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Connection(_) => "not_connected",
            BridgeError::Timeout { .. } => "timeout",
            BridgeError::Protocol(_) => "protocol_error",
            BridgeError::Prediction(PredictionError::NoSnippet) => "no_snippet",
            BridgeError::Prediction(PredictionError::NoCandidates) => "no_candidates",
            BridgeError::Prediction(PredictionError::Failed(_)) => "prediction_failed",
            BridgeError::Apply { .. } => "apply_failed",
            BridgeError::Server(_) => "server_error",
            BridgeError::Busy(_) => "busy",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
