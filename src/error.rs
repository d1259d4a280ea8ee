// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay engine.
//!
//! Errors are split between the ones an operator provokes (and should see
//! verbatim) and the ones raised by the engine's collaborators.
//!
//! # Error Categories
//!
//! | Error Type | Operator-facing | Description |
//! |------------|-----------------|-------------|
//! | `AlreadyReplaying` | Yes | A replay session is already active |
//! | `NoMatchingProcessors` | Yes | Requested groups resolve to nothing |
//! | `ResetProtocol` | No | Pinned boundary could not be persisted |
//! | `TokenStore` | No | SQLite error in the segment token store |
//! | `TokenCodec` | No | A persisted token could not be decoded |
//! | `EventLog` | No | The event log rejected a read or publish |
//! | `InvalidState` | No | Lifecycle violation (e.g. reset while running) |
//! | `Config` | No | Configuration invalid |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Mode switches attempted while already in the target mode are *not*
//! errors: they are logged and return `Ok(())`.

use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// Errors that can occur while controlling a replay.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// A replay session is already in progress.
    ///
    /// No state is changed. The operator must wait for the running
    /// session to catch up.
    #[error("Cannot start replay while an existing one is running")]
    AlreadyReplaying,

    /// The requested processing groups matched no replay-capable processor.
    #[error("No matching replay-capable processor for groups {requested:?}")]
    NoMatchingProcessors { requested: Vec<String> },

    /// The reset protocol could not durably pin the catch-up boundary.
    ///
    /// Fatal for the `start_replay` call that raised it. The processor is
    /// switched back to push mode before this is returned.
    #[error("Reset protocol failed for group {group}: {message}")]
    ResetProtocol { group: String, message: String },

    /// SQLite error in the segment token store.
    #[error("Token store error: {0}")]
    TokenStore(#[from] sqlx::Error),

    /// A persisted segment token could not be encoded or decoded.
    #[error("Token codec error: {0}")]
    TokenCodec(String),

    /// The event log failed to serve a read or accept a publish.
    #[error("Event log error: {0}")]
    EventLog(String),

    /// Operation attempted in the wrong lifecycle state.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplayError {
    /// Create a reset protocol failure for a group.
    pub fn reset_protocol(group: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        Self::ResetProtocol {
            group: group.into(),
            message: cause.to_string(),
        }
    }

    /// Check if this error is a rejection of the operator's request
    /// (as opposed to an engine or collaborator failure).
    pub fn is_operator_error(&self) -> bool {
        matches!(
            self,
            Self::AlreadyReplaying | Self::NoMatchingProcessors { .. }
        )
    }

    /// Short label used for the `error_type` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyReplaying => "already_replaying",
            Self::NoMatchingProcessors { .. } => "no_matching_processors",
            Self::ResetProtocol { .. } => "reset_protocol",
            Self::TokenStore(_) => "token_store",
            Self::TokenCodec(_) => "token_codec",
            Self::EventLog(_) => "event_log",
            Self::InvalidState { .. } => "invalid_state",
            Self::Config(_) => "config",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ReplayError {
    fn from(e: serde_json::Error) -> Self {
        Self::TokenCodec(e.to_string())
    }
}
