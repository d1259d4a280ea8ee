// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event messages carried by the log.
//!
//! Two payload kinds exist: ordinary domain events, and the replay marker
//! the coordinator appends once per session as a wake-up signal. Markers
//! carry no domain meaning and are never dispatched to handlers.

use crate::token::Token;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique sentinel appended once per replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub id: Uuid,
}

impl ReplayMarker {
    /// Fresh marker with a random id.
    pub fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }
}

impl Default for ReplayMarker {
    fn default() -> Self {
        Self::new()
    }
}

/// Event payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// An ordinary domain event.
    Domain {
        /// Event type name (e.g. `"OrganizationCreated"`).
        event_type: String,
        /// Key that decides segment ownership; events sharing a key are
        /// always handled by the same segment, in order.
        sequence_key: String,
        data: serde_json::Value,
    },

    /// Replay completion sentinel.
    ReplayMarker(ReplayMarker),
}

impl EventPayload {
    /// Convenience constructor for a domain payload.
    pub fn domain(
        event_type: impl Into<String>,
        sequence_key: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        EventPayload::Domain {
            event_type: event_type.into(),
            sequence_key: sequence_key.into(),
            data,
        }
    }

    /// Payload type name, used for logging and metrics labels.
    pub fn type_name(&self) -> &str {
        match self {
            EventPayload::Domain { event_type, .. } => event_type,
            EventPayload::ReplayMarker(_) => "ReplayMarker",
        }
    }
}

/// An event as appended to the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl EventMessage {
    /// Wrap a payload with a fresh id and the current time.
    pub fn new(payload: EventPayload) -> Self {
        Self::at(payload, Utc::now())
    }

    /// Wrap a payload with an explicit timestamp.
    pub fn at(payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp,
            payload,
        }
    }

    /// The marker carried by this message, if it is one.
    pub fn as_replay_marker(&self) -> Option<&ReplayMarker> {
        match &self.payload {
            EventPayload::ReplayMarker(marker) => Some(marker),
            EventPayload::Domain { .. } => None,
        }
    }

    /// Whether this message is a replay marker.
    pub fn is_replay_marker(&self) -> bool {
        self.as_replay_marker().is_some()
    }

    /// Key used to assign the event to a pull segment.
    pub fn sequence_key(&self) -> String {
        match &self.payload {
            EventPayload::Domain { sequence_key, .. } => sequence_key.clone(),
            EventPayload::ReplayMarker(marker) => marker.id.to_string(),
        }
    }
}

/// An event together with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
    pub position: Token,
    pub message: EventMessage,
}

impl TrackedEvent {
    /// Segment (out of `segment_count`) that owns this event.
    pub fn segment(&self, segment_count: u32) -> u32 {
        segment_for_key(&self.message.sequence_key(), segment_count)
    }
}

/// Stable segment assignment: SHA-256 of the key, first 8 bytes, modulo
/// the segment count.
pub fn segment_for_key(key: &str, segment_count: u32) -> u32 {
    use sha2::{Digest, Sha256};

    if segment_count <= 1 {
        return 0;
    }
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % segment_count as u64) as u32
}
