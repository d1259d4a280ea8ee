//! Engine state and health types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (processors started)
//!    ↓                              ↓
//! Stopped                       Running
//!    ↑                              │
//!    │                    shutdown()│
//!    │                              ↓
//!    └────────────────── ShuttingDown
//!
//! Starting ──(token store or processor failure)──→ Failed
//! ```
//!
//! - **Created**: after `ReplayEngine::new()`. Handlers and observers may be registered.
//! - **Starting**: token store opening, processors being built and started.
//! - **Running**: groups consuming; replays may be started.
//! - **ShuttingDown**: processors stopping, tokens being persisted.
//! - **Stopped**: clean shutdown complete. Safe to drop.
//! - **Failed**: start failed. Check logs; the engine cannot be restarted.

use crate::config::ProcessorType;
use crate::coordinator::ReplayStatus;
use crate::processor::ProcessorMode;
use crate::token::SegmentToken;
use std::collections::BTreeMap;

/// State of the replay engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Starting => write!(f, "Starting"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Health of one processing group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupHealth {
    pub name: String,
    pub processor_type: ProcessorType,
    /// Current consumption mode.
    pub mode: ProcessorMode,
    /// Whether the group is behind a pinned replay boundary.
    pub replaying: bool,
    /// Per-segment tokens (empty for push-only groups).
    pub segments: BTreeMap<u32, SegmentToken>,
}

/// Snapshot for monitoring endpoints. Collected from in-memory state only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and able to accept replay requests.
    pub ready: bool,
    pub groups: Vec<GroupHealth>,
    /// Replay control plane status (`None` before start).
    pub replay: Option<ReplayStatus>,
}
