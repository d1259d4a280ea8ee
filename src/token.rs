// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream positions and segment tokens.
//!
//! A [`Token`] is a position in the event log: position `p` means every event
//! with sequence `<= p` has been seen, so reading resumes at `p + 1`.
//! [`Token::TAIL`] (position 0) sits before the first event.
//!
//! A [`SegmentToken`] is what a pull segment persists. It is either a plain
//! tracking position or a composite reset token:
//!
//! ```text
//! Replaying { current, replay_until }
//!     current < replay_until   → segment is replaying
//!     current >= replay_until  → collapses to Tracking(current)
//! ```
//!
//! The collapse happens inside [`SegmentToken::advance_to`], so catch-up is
//! detected from the token alone with no external bookkeeping.

use crate::error::{ReplayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Immutable, totally ordered position in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    /// Logical beginning of the stream (before the first event).
    pub const TAIL: Token = Token(0);

    /// Token at a raw position.
    pub const fn at_position(position: u64) -> Self {
        Token(position)
    }

    /// Raw position.
    pub const fn position(&self) -> u64 {
        self.0
    }

    /// Whether this token has seen everything `other` has seen.
    pub fn covers(&self, other: &Token) -> bool {
        self.0 >= other.0
    }

    /// Number of events between this token and a later one.
    pub fn distance_to(&self, later: &Token) -> u64 {
        later.0.saturating_sub(self.0)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted token of one pull segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SegmentToken {
    /// Ordinary incremental tracking.
    Tracking { position: Token },

    /// Composite reset token: reading forward from `current`, replaying
    /// until `replay_until` is reached.
    Replaying { current: Token, replay_until: Token },
}

impl SegmentToken {
    /// Plain tracking token.
    pub fn tracking(position: Token) -> Self {
        SegmentToken::Tracking { position }
    }

    /// Composite reset token resuming from `resume_from` and replaying until
    /// `replay_until`.
    ///
    /// If `resume_from` already covers the boundary there is nothing to
    /// replay and a plain tracking token is returned instead.
    pub fn reset(resume_from: Token, replay_until: Token) -> Self {
        if resume_from.covers(&replay_until) {
            SegmentToken::Tracking { position: resume_from }
        } else {
            SegmentToken::Replaying {
                current: resume_from,
                replay_until,
            }
        }
    }

    /// Current consumption position.
    pub fn position(&self) -> Token {
        match self {
            SegmentToken::Tracking { position } => *position,
            SegmentToken::Replaying { current, .. } => *current,
        }
    }

    /// Pinned boundary, if this segment is replaying.
    pub fn replay_until(&self) -> Option<Token> {
        match self {
            SegmentToken::Tracking { .. } => None,
            SegmentToken::Replaying { replay_until, .. } => Some(*replay_until),
        }
    }

    /// Whether the segment is still behind its pinned boundary.
    pub fn is_replaying(&self) -> bool {
        matches!(self, SegmentToken::Replaying { .. })
    }

    /// Whether an event at `position` is being re-delivered as part of the
    /// replay (at or before the pinned boundary).
    pub fn is_replay_of(&self, position: Token) -> bool {
        match self {
            SegmentToken::Tracking { .. } => false,
            SegmentToken::Replaying { replay_until, .. } => replay_until.covers(&position),
        }
    }

    /// Advance to `position`, collapsing the composite wrapper once the
    /// boundary is reached.
    ///
    /// Positions never move backwards: advancing to an older position
    /// returns the token unchanged.
    pub fn advance_to(self, position: Token) -> Self {
        match self {
            SegmentToken::Tracking { position: current } => SegmentToken::Tracking {
                position: current.max(position),
            },
            SegmentToken::Replaying {
                current,
                replay_until,
            } => SegmentToken::reset(current.max(position), replay_until),
        }
    }

    /// Events left before the boundary (0 when tracking).
    pub fn replay_remaining(&self) -> u64 {
        match self {
            SegmentToken::Tracking { .. } => 0,
            SegmentToken::Replaying {
                current,
                replay_until,
            } => current.distance_to(replay_until),
        }
    }

    /// Encode for persistence.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a persisted token.
    pub fn decode(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| ReplayError::TokenCodec(format!("invalid segment token {:?}: {}", raw, e)))
    }
}

impl fmt::Display for SegmentToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SegmentToken::Tracking { position } => write!(f, "Tracking({})", position),
            SegmentToken::Replaying {
                current,
                replay_until,
            } => write!(f, "Replaying({} -> {})", current, replay_until),
        }
    }
}
