//! # Code Bridge
//!
//! A request/response command channel between browser-side assistants and a
//! locally running editor companion, plus a lexical destination predictor
//! for applying suggested code changes to the right file.
//!
//! The companion speaks JSON frames over one local WebSocket with no
//! request ids and no delivery guarantees. This crate turns that into typed
//! calls with reconnection, correlation, and timeouts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────────┐   ┌──────────────┐
//! │ CLI/HTTP │──▶│  Bridge   │──▶│ Multiplexer │──▶│  Connection  │──▶ companion
//! └──────────┘   └─────┬─────┘   └─────────────┘   └──────────────┘
//!                      │
//!            ┌─────────┼──────────┐
//!            ▼         ▼          ▼
//!       FileCache  Predictor  ApplyOrchestrator
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! cbridge files                          # list workspace files
//! cbridge predict "fn parse(input: &str)"
//! cbridge apply - --yes < snippet.rs     # apply to the best match
//! cbridge serve                          # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Wire frames exchanged with the companion |
//! | [`connection`] | Socket lifecycle and bounded reconnection |
//! | [`multiplexer`] | Reply correlation and per-request timeouts |
//! | [`cache`] | Fetched file contents |
//! | [`predictor`] | TF-IDF + cosine destination ranking |
//! | [`apply`] | Confirm-and-apply state machine |
//! | [`bridge`] | The service tying it all together |
//! | [`state`] | Persisted file list and port |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`server`] | Local HTTP API |
//! | [`commands`] | CLI command implementations |

pub mod apply;
pub mod bridge;
pub mod cache;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod multiplexer;
pub mod predictor;
pub mod protocol;
pub mod server;
pub mod state;

pub use bridge::Bridge;
pub use error::{BridgeError, BridgeResult, PredictionError};
