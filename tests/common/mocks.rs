//! Recording and failure-injecting collaborators.
//!
//! Handlers and observers record what they saw for assertions. The token
//! store and event log wrappers delegate to the in-memory implementations
//! and fail on demand.

use replay_engine::coordinator::{ObserverError, ObserverFuture, ReplayCompletionObserver, ReplaySession};
use replay_engine::event::{EventPayload, TrackedEvent};
use replay_engine::event_log::{BoxFuture, EventLog, InMemoryEventLog};
use replay_engine::handler::{EventHandler, HandlerError, HandlerFuture, ProcessingContext};
use replay_engine::token::{SegmentToken, Token};
use replay_engine::token_store::{InMemoryTokenStore, SegmentTokenStore};
use replay_engine::ReplayError;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// One handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handled {
    pub position: Token,
    pub sequence_key: String,
    pub segment: Option<u32>,
    pub replaying: bool,
}

/// Handler that records every event it handles.
#[derive(Default)]
pub struct RecordingHandler {
    handled: Mutex<Vec<Handled>>,
    resets: AtomicUsize,
    /// Refuse `on_reset`.
    fail_reset: AtomicBool,
    /// Fail events with this sequence key.
    fail_key: Mutex<Option<String>>,
    /// Block events with this sequence key (`"*"` blocks all) until released.
    held_key: Mutex<Option<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn handled(&self) -> Vec<Handled> {
        self.handled.lock().unwrap().clone()
    }

    pub fn handled_count(&self) -> usize {
        self.handled.lock().unwrap().len()
    }

    pub fn replayed(&self) -> Vec<Handled> {
        self.handled().into_iter().filter(|h| h.replaying).collect()
    }

    pub fn reset_count(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn refuse_reset(&self) {
        self.fail_reset.store(true, Ordering::SeqCst);
    }

    pub fn fail_on(&self, key: &str) {
        *self.fail_key.lock().unwrap() = Some(key.to_string());
    }

    /// Block events keyed `key` (or every event for `"*"`) until [`release`](Self::release).
    pub fn hold(&self, key: &str) {
        *self.held_key.lock().unwrap() = Some(key.to_string());
    }

    pub fn release(&self) {
        *self.held_key.lock().unwrap() = None;
    }

    fn is_held(&self, key: &str) -> bool {
        match self.held_key.lock().unwrap().as_deref() {
            Some("*") => true,
            Some(held) => held == key,
            None => false,
        }
    }

    pub fn clear(&self) {
        self.handled.lock().unwrap().clear();
    }
}

impl EventHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    fn handle<'a>(&'a self, event: &'a TrackedEvent, ctx: &'a ProcessingContext) -> HandlerFuture<'a> {
        Box::pin(async move {
            let key = event.message.sequence_key();
            while self.is_held(&key) {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            }
            if self.fail_key.lock().unwrap().as_deref() == Some(key.as_str()) {
                return Err(HandlerError(format!("refusing {}", key)));
            }
            self.handled.lock().unwrap().push(Handled {
                position: event.position,
                sequence_key: key,
                segment: ctx.segment,
                replaying: ctx.replaying,
            });
            Ok(())
        })
    }

    fn on_reset(&self) -> HandlerFuture<'_> {
        Box::pin(async move {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.fail_reset.load(Ordering::SeqCst) {
                return Err(HandlerError("reset refused".to_string()));
            }
            Ok(())
        })
    }
}

/// Observer that records completed sessions.
#[derive(Default)]
pub struct RecordingObserver {
    sessions: Mutex<Vec<ReplaySession>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sessions(&self) -> Vec<ReplaySession> {
        self.sessions.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl ReplayCompletionObserver for RecordingObserver {
    fn name(&self) -> &str {
        "recording"
    }

    fn on_replay_completed<'a>(&'a self, session: &'a ReplaySession) -> ObserverFuture<'a> {
        Box::pin(async move {
            self.sessions.lock().unwrap().push(session.clone());
            Ok(())
        })
    }
}

/// How a [`FailingObserver`] fails.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Error,
    Panic,
}

/// Observer that always fails.
pub struct FailingObserver {
    failure: Failure,
    calls: AtomicUsize,
}

impl FailingObserver {
    pub fn new(failure: Failure) -> Arc<Self> {
        Arc::new(Self {
            failure,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ReplayCompletionObserver for FailingObserver {
    fn name(&self) -> &str {
        "failing"
    }

    fn on_replay_completed<'a>(&'a self, _session: &'a ReplaySession) -> ObserverFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.failure;
        Box::pin(async move {
            match failure {
                Failure::Error => Err(ObserverError("observer broke".to_string())),
                Failure::Panic => panic!("observer panicked"),
            }
        })
    }
}

/// Token store that can be told to fail pinning.
#[derive(Default)]
pub struct FlakyTokenStore {
    inner: InMemoryTokenStore,
    fail_pin: AtomicBool,
}

impl FlakyTokenStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_pin(&self, fail: bool) {
        self.fail_pin.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryTokenStore {
        &self.inner
    }
}

impl SegmentTokenStore for FlakyTokenStore {
    fn fetch_segments(&self, group: &str) -> BoxFuture<'_, Vec<u32>> {
        self.inner.fetch_segments(group)
    }

    fn fetch_token(&self, group: &str, segment: u32) -> BoxFuture<'_, Option<SegmentToken>> {
        self.inner.fetch_token(group, segment)
    }

    fn store_token(&self, group: &str, segment: u32, token: SegmentToken) -> BoxFuture<'_, ()> {
        self.inner.store_token(group, segment, token)
    }

    fn initialize_segments(&self, group: &str, count: u32, token: SegmentToken) -> BoxFuture<'_, Vec<u32>> {
        self.inner.initialize_segments(group, count, token)
    }

    fn pin_segments(&self, group: &str, initial_count: u32, pinned: Token) -> BoxFuture<'_, Vec<u32>> {
        if self.fail_pin.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ReplayError::Internal("token store unavailable".to_string())) });
        }
        self.inner.pin_segments(group, initial_count, pinned)
    }

    fn store_tokens(&self, group: &str, tokens: Vec<(u32, SegmentToken)>) -> BoxFuture<'_, ()> {
        self.inner.store_tokens(group, tokens)
    }
}

/// Event log that can be told to refuse publishes.
#[derive(Default)]
pub struct FlakyEventLog {
    inner: InMemoryEventLog,
    fail_publish: AtomicBool,
}

impl FlakyEventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn inner(&self) -> &InMemoryEventLog {
        &self.inner
    }
}

impl EventLog for FlakyEventLog {
    fn head(&self) -> BoxFuture<'_, Token> {
        self.inner.head()
    }

    fn at(&self, timestamp: DateTime<Utc>) -> BoxFuture<'_, Token> {
        self.inner.at(timestamp)
    }

    fn publish(&self, payload: EventPayload) -> BoxFuture<'_, Token> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ReplayError::EventLog("log unavailable".to_string())) });
        }
        self.inner.publish(payload)
    }

    fn read_after(&self, after: Token, limit: usize) -> BoxFuture<'_, Vec<TrackedEvent>> {
        self.inner.read_after(after, limit)
    }

    fn subscribe(&self) -> broadcast::Receiver<TrackedEvent> {
        self.inner.subscribe()
    }
}
