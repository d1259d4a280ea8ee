//! Operator-facing replay types.
//!
//! These are the payloads of the admin surface. They are transport
//! agnostic: field names serialize in camelCase so they can be exposed as
//! JSON directly.
//!
//! ```json
//! GET  status  → { "switchingProcessorCount": 3, "isReplaying": false }
//! POST replay  ← { "processingGroups": ["organizations"], "startTime": "2026-01-01T00:00:00Z" }
//! ```

use crate::token::Token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Snapshot of the replay control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayStatus {
    /// Number of replay-capable processors known to the coordinator.
    pub switching_processor_count: usize,
    /// Whether a replay session is active.
    pub is_replaying: bool,
}

/// Request to start a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReplayRequest {
    /// Groups to replay. `None` means every replay-capable group.
    #[serde(default)]
    pub processing_groups: Option<HashSet<String>>,
    /// Replay events at or after this time. `None` means from the tail.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
}

impl StartReplayRequest {
    /// Replay every group from the beginning.
    pub fn all() -> Self {
        Self::default()
    }

    /// Replay the named groups from the beginning.
    pub fn for_groups<I, S>(groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            processing_groups: Some(groups.into_iter().map(Into::into).collect()),
            start_time: None,
        }
    }

    /// Only replay events at or after `start_time`.
    pub fn since(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Requested group names, sorted (for error messages).
    pub fn requested_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self
            .processing_groups
            .as_ref()
            .map(|g| g.iter().cloned().collect())
            .unwrap_or_default();
        groups.sort();
        groups
    }
}

/// A running replay, identified by the id of its marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySession {
    pub id: Uuid,
    pub target_groups: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub start_token: Token,
}
