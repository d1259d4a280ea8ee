// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event log integration trait.
//!
//! The event log itself (durable storage, tailing) is an external
//! collaborator. The replay engine only needs:
//!
//! - `head()` / `tail()` / `at(t)` to build tokens
//! - `publish()` to append the replay marker
//! - `read_after()` for position-based pull consumption
//! - `subscribe()` for immediate push delivery
//!
//! [`InMemoryEventLog`] is a complete implementation used by tests and
//! standalone mode.
//!
//! # Example
//!
//! ```rust,no_run
//! use replay_engine::event_log::{EventLog, InMemoryEventLog};
//! use replay_engine::event::EventPayload;
//!
//! # async fn example() -> replay_engine::Result<()> {
//! let log = InMemoryEventLog::new();
//! let position = log
//!     .publish(EventPayload::domain("OrgCreated", "org-1", serde_json::json!({})))
//!     .await?;
//! assert_eq!(log.head().await?, position);
//! # Ok(())
//! # }
//! ```

use crate::error::{ReplayError, Result};
use crate::event::{EventMessage, EventPayload, TrackedEvent};
use crate::token::Token;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{broadcast, RwLock};
use tracing::trace;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Default capacity of the live broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 1024;

/// What the replay engine needs from the event log.
pub trait EventLog: Send + Sync + 'static {
    /// Position of the last appended event, as of now.
    fn head(&self) -> BoxFuture<'_, Token>;

    /// Logical beginning of the stream.
    fn tail(&self) -> BoxFuture<'_, Token> {
        Box::pin(async { Ok(Token::TAIL) })
    }

    /// Token positioned just before the first event at or after `timestamp`.
    fn at(&self, timestamp: DateTime<Utc>) -> BoxFuture<'_, Token>;

    /// Append an event and return its position.
    fn publish(&self, payload: EventPayload) -> BoxFuture<'_, Token>;

    /// Read up to `limit` events strictly after `after`, in order.
    fn read_after(&self, after: Token, limit: usize) -> BoxFuture<'_, Vec<TrackedEvent>>;

    /// Subscribe to events appended from now on.
    fn subscribe(&self) -> broadcast::Receiver<TrackedEvent>;
}

/// In-memory event log.
///
/// Positions are 1-based sequence numbers; event `n` lives at index `n - 1`.
pub struct InMemoryEventLog {
    events: RwLock<Vec<TrackedEvent>>,
    live: broadcast::Sender<TrackedEvent>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Create an empty log with a custom live-channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            events: RwLock::new(Vec::new()),
            live,
        }
    }

    /// Append with an explicit timestamp (used to seed history).
    pub async fn append_at(&self, payload: EventPayload, timestamp: DateTime<Utc>) -> Token {
        self.append(EventMessage::at(payload, timestamp)).await
    }

    async fn append(&self, message: EventMessage) -> Token {
        // Append and broadcast under the write lock so subscribers observe
        // the same order as readers.
        let mut events = self.events.write().await;
        let position = Token::at_position(events.len() as u64 + 1);
        let tracked = TrackedEvent { position, message };
        events.push(tracked.clone());
        trace!(position = %position, kind = %tracked.message.payload.type_name(), "Appended event");
        // No live subscribers is fine: pull consumers read from storage.
        let _ = self.live.send(tracked);
        position
    }

    /// Number of events in the log.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    /// Whether the log is empty.
    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// All events (for assertions).
    pub async fn snapshot(&self) -> Vec<TrackedEvent> {
        self.events.read().await.clone()
    }
}

impl EventLog for InMemoryEventLog {
    fn head(&self) -> BoxFuture<'_, Token> {
        Box::pin(async move { Ok(Token::at_position(self.events.read().await.len() as u64)) })
    }

    fn at(&self, timestamp: DateTime<Utc>) -> BoxFuture<'_, Token> {
        Box::pin(async move {
            let events = self.events.read().await;
            let index = events
                .iter()
                .position(|e| e.message.timestamp >= timestamp)
                .unwrap_or(events.len());
            Ok(Token::at_position(index as u64))
        })
    }

    fn publish(&self, payload: EventPayload) -> BoxFuture<'_, Token> {
        Box::pin(async move { Ok(self.append(EventMessage::new(payload)).await) })
    }

    fn read_after(&self, after: Token, limit: usize) -> BoxFuture<'_, Vec<TrackedEvent>> {
        Box::pin(async move {
            if limit == 0 {
                return Err(ReplayError::EventLog("read limit must be positive".to_string()));
            }
            let events = self.events.read().await;
            let start = (after.position() as usize).min(events.len());
            let end = start.saturating_add(limit).min(events.len());
            Ok(events[start..end].to_vec())
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackedEvent> {
        self.live.subscribe()
    }
}
