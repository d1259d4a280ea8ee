// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay-capable processor.
//!
//! Wraps a [`PushProcessor`] and a [`PullProcessor`] for the same group and
//! runs exactly one of them, selected by an atomic mode cell.
//!
//! # Mode Switch
//!
//! ```text
//!            start_replay(start)                 stop_replay()
//!   Push ───── CAS Push→Pull ─────► Pull ───── CAS Pull→Push ─────► Push
//!              shutdown push                    subscribe live
//!              reset protocol                   shutdown pull
//!              start pull                       catch up to head
//!                                               start push after head
//! ```
//!
//! A lost compare-and-swap means the processor is already in the requested
//! mode; the call is logged and returns `Ok(())`.
//!
//! # Handover
//!
//! Events appended after the pinned boundary may not have been read by
//! every segment when the workers stop. The live receiver is subscribed
//! before the workers are told to stop; the log is then read up to its
//! head, delivering what no segment handled, and push skips everything up
//! to that head. Each event is delivered exactly once across the switch.
//!
//! Once [`shutdown`](ReplayCapableProcessor::shutdown) has been called the
//! processor is terminal: neither `start` nor a late `stop_replay` revives
//! the push half.
//!
//! # Reset Protocol
//!
//! 1. `pinned = event_log.head()`, before any segment is touched
//! 2. handlers' `on_reset`
//! 3. pin every segment at `pinned` (one atomic store operation)
//! 4. write `SegmentToken::reset(start, pinned)` for every segment (one
//!    atomic store operation), adopted by the pull processor's status
//!
//! If any step fails, or the pull processor cannot start, the processor
//! swaps back to push mode, restarts push and returns
//! [`ReplayError::ResetProtocol`].

use super::{ProcessorMode, PullProcessor, PushProcessor};
use crate::error::{ReplayError, Result};
use crate::event::TrackedEvent;
use crate::event_log::EventLog;
use crate::handler::{HandlerInterceptor, Registration};
use crate::metrics;
use crate::token::{SegmentToken, Token};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// The half of a [`ReplayCapableProcessor`] selected by its mode cell.
pub enum ActiveProcessor<'a> {
    Push(&'a PushProcessor),
    Pull(&'a PullProcessor),
}

impl ActiveProcessor<'_> {
    pub fn mode(&self) -> ProcessorMode {
        match self {
            ActiveProcessor::Push(_) => ProcessorMode::Push,
            ActiveProcessor::Pull(_) => ProcessorMode::Pull,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ActiveProcessor::Push(p) => p.name(),
            ActiveProcessor::Pull(p) => p.name(),
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            ActiveProcessor::Push(p) => p.start().await,
            ActiveProcessor::Pull(p) => p.start().await,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            ActiveProcessor::Push(p) => p.shutdown().await,
            ActiveProcessor::Pull(p) => p.shutdown().await,
        }
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        match self {
            ActiveProcessor::Push(p) => p.register_interceptor(interceptor),
            ActiveProcessor::Pull(p) => p.register_interceptor(interceptor),
        }
    }
}

/// Processor that runs push by default and switches to pull to replay.
pub struct ReplayCapableProcessor {
    name: String,
    mode: AtomicU8,
    push: PushProcessor,
    pull: PullProcessor,
    event_log: Arc<dyn EventLog>,
    transitions: AtomicU64,
    terminated: AtomicBool,
}

impl ReplayCapableProcessor {
    /// Both halves must belong to the same group. The processor starts in
    /// push mode.
    pub fn new(push: PushProcessor, pull: PullProcessor, event_log: Arc<dyn EventLog>) -> Self {
        let name = push.name().to_string();
        debug_assert_eq!(name, pull.name());
        metrics::set_processor_mode(&name, ProcessorMode::Push.as_str());
        Self {
            name,
            mode: AtomicU8::new(ProcessorMode::Push.as_u8()),
            push,
            pull,
            event_log,
            transitions: AtomicU64::new(0),
            terminated: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> ProcessorMode {
        ProcessorMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    /// The half currently selected by the mode cell.
    pub fn active(&self) -> ActiveProcessor<'_> {
        match self.mode() {
            ProcessorMode::Push => ActiveProcessor::Push(&self.push),
            ProcessorMode::Pull => ActiveProcessor::Pull(&self.pull),
        }
    }

    /// Number of successful mode switches (diagnostics).
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(Ordering::Relaxed)
    }

    /// Whether the processor is pulling and any segment is still behind its
    /// pinned boundary.
    pub fn is_replaying(&self) -> bool {
        self.mode() == ProcessorMode::Pull && self.pull.any_replaying()
    }

    /// Per-segment tokens of the pull half.
    pub fn processing_status(&self) -> BTreeMap<u32, SegmentToken> {
        self.pull.processing_status()
    }

    pub async fn start(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(ReplayError::InvalidState {
                expected: "processor not shut down".to_string(),
                actual: "shut down".to_string(),
            });
        }
        self.active().start().await
    }

    /// Shut down both halves for good.
    pub async fn shutdown(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.push.shutdown().await;
        self.pull.shutdown().await;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        self.active().register_interceptor(interceptor)
    }

    fn swap_mode(&self, from: ProcessorMode, to: ProcessorMode) -> bool {
        let swapped = self
            .mode
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if swapped {
            self.transitions.fetch_add(1, Ordering::Relaxed);
            metrics::record_mode_transition(&self.name, to.as_str());
            metrics::set_processor_mode(&self.name, to.as_str());
        }
        swapped
    }

    /// Switch to pull mode and replay from `start`.
    pub async fn start_replay(&self, start: Token) -> Result<()> {
        if !self.swap_mode(ProcessorMode::Push, ProcessorMode::Pull) {
            info!(group = %self.name, "Processor already in pull mode, ignoring replay request");
            metrics::record_mode_transition_noop(&self.name, ProcessorMode::Pull.as_str());
            return Ok(());
        }
        info!(group = %self.name, start = %start, "Switching to pull mode for replay");

        self.push.shutdown().await;

        let started = Instant::now();
        match self.reset_and_pull(start).await {
            Ok(pinned) => {
                metrics::record_reset(&self.name, true, started.elapsed());
                info!(group = %self.name, start = %start, pinned = %pinned, "Replay started");
                Ok(())
            }
            Err(e) => {
                metrics::record_reset(&self.name, false, started.elapsed());
                metrics::record_error(&self.name, e.kind());
                error!(group = %self.name, error = %e, "Reset protocol failed, reverting to push mode");

                self.pull.shutdown().await;
                if !self.swap_mode(ProcessorMode::Pull, ProcessorMode::Push) {
                    warn!(group = %self.name, "Mode changed during failed reset");
                }
                if let Err(restart) = self.resume_push(self.event_log.subscribe(), Token::TAIL).await {
                    error!(group = %self.name, error = %restart, "Failed to restart push processor");
                }

                Err(match e {
                    ReplayError::ResetProtocol { .. } => e,
                    other => ReplayError::reset_protocol(self.name.clone(), other),
                })
            }
        }
    }

    async fn reset_and_pull(&self, start: Token) -> Result<Token> {
        let pinned = self.event_log.head().await?;
        self.pull.reset_tokens(start, pinned).await?;
        self.pull.start().await?;
        Ok(pinned)
    }

    /// Switch back to push mode without losing events appended meanwhile.
    pub async fn stop_replay(&self) -> Result<()> {
        if !self.swap_mode(ProcessorMode::Pull, ProcessorMode::Push) {
            info!(group = %self.name, "Processor already in push mode, ignoring stop request");
            metrics::record_mode_transition_noop(&self.name, ProcessorMode::Push.as_str());
            return Ok(());
        }

        let live = self.event_log.subscribe();
        self.pull.shutdown().await;
        if self.is_terminated() {
            debug!(group = %self.name, "Processor shut down, skipping handover");
            return Ok(());
        }

        match self.catch_up().await {
            Ok(head) => {
                self.resume_push(live, head).await?;
                info!(group = %self.name, after = %head, "Switched back to push mode");
                Ok(())
            }
            Err(e) => {
                error!(group = %self.name, error = %e, "Catch-up failed, resuming push from the subscription");
                metrics::record_error(&self.name, e.kind());
                self.resume_push(live, Token::TAIL).await?;
                Err(e)
            }
        }
    }

    /// Deliver what the pull workers left unread, up to the current head.
    async fn catch_up(&self) -> Result<Token> {
        let head = self.event_log.head().await?;
        let delivered = self.pull.catch_up_to(head).await?;
        metrics::record_handover_catch_up(&self.name, delivered);
        if delivered > 0 {
            info!(group = %self.name, delivered, head = %head, "Delivered events appended during replay");
        }
        Ok(head)
    }

    async fn resume_push(&self, live: broadcast::Receiver<TrackedEvent>, delivered_through: Token) -> Result<()> {
        if self.is_terminated() {
            debug!(group = %self.name, "Processor shut down, not resuming push");
            return Ok(());
        }
        self.push.start_after(live, delivered_through).await?;
        // A shutdown racing the start may have missed the new subscription.
        if self.is_terminated() {
            self.push.shutdown().await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ReplayCapableProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCapableProcessor")
            .field("name", &self.name)
            .field("mode", &self.mode())
            .field("transitions", &self.transition_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PullConfig, PushConfig};
    use crate::event::EventPayload;
    use crate::event_log::InMemoryEventLog;
    use crate::handler::{EventHandler, HandlerError, HandlerFuture, ProcessingContext};
    use crate::processor::Dispatcher;
    use crate::token_store::InMemoryTokenStore;
    use serde_json::json;
    use std::time::Duration;

    struct RefusesReset;

    impl EventHandler for RefusesReset {
        fn handle<'a>(&'a self, _event: &'a TrackedEvent, _ctx: &'a ProcessingContext) -> HandlerFuture<'a> {
            Box::pin(async { Ok(()) })
        }

        fn on_reset(&self) -> HandlerFuture<'_> {
            Box::pin(async { Err(HandlerError("read model is shared".to_string())) })
        }
    }

    #[derive(Default)]
    struct Keys {
        seen: std::sync::Mutex<Vec<(String, bool)>>,
    }

    impl Keys {
        fn count(&self, key: &str) -> usize {
            self.seen.lock().unwrap().iter().filter(|(k, _)| k == key).count()
        }

        fn replayed(&self, key: &str) -> bool {
            self.seen.lock().unwrap().iter().any(|(k, replaying)| k == key && *replaying)
        }
    }

    impl EventHandler for Keys {
        fn handle<'a>(&'a self, event: &'a TrackedEvent, ctx: &'a ProcessingContext) -> HandlerFuture<'a> {
            self.seen
                .lock()
                .unwrap()
                .push((event.message.sequence_key(), ctx.replaying));
            Box::pin(async { Ok(()) })
        }
    }

    fn build(log: Arc<InMemoryEventLog>, store: Arc<InMemoryTokenStore>, dispatcher: Dispatcher) -> ReplayCapableProcessor {
        let pull_config = PullConfig {
            batch_size: 8,
            poll_interval: "5ms".to_string(),
            shutdown_timeout: "1s".to_string(),
        };
        let push_config = PushConfig {
            shutdown_timeout: "1s".to_string(),
        };
        ReplayCapableProcessor::new(
            PushProcessor::new(dispatcher.clone(), log.clone(), push_config),
            PullProcessor::new(dispatcher, log.clone(), store, 2, pull_config),
            log,
        )
    }

    async fn seed(log: &InMemoryEventLog, count: usize) {
        for i in 0..count {
            log.publish(EventPayload::domain("T", format!("k{}", i), json!({})))
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_starts_in_push_mode() {
        let log = Arc::new(InMemoryEventLog::new());
        let processor = build(log, Arc::new(InMemoryTokenStore::new()), Dispatcher::new("g"));
        assert_eq!(processor.mode(), ProcessorMode::Push);
        assert_eq!(processor.active().mode(), ProcessorMode::Push);
        assert!(!processor.is_replaying());
        assert_eq!(processor.transition_count(), 0);
    }

    #[tokio::test]
    async fn test_start_replay_pins_head() {
        let log = Arc::new(InMemoryEventLog::new());
        seed(&log, 10).await;
        let store = Arc::new(InMemoryTokenStore::new());
        let processor = build(log.clone(), store.clone(), Dispatcher::new("g"));
        processor.start().await.unwrap();

        processor.start_replay(Token::TAIL).await.unwrap();
        assert_eq!(processor.mode(), ProcessorMode::Pull);
        assert_eq!(processor.transition_count(), 1);

        // Events appended after the switch do not move the boundary
        seed(&log, 5).await;
        for token in processor.processing_status().values() {
            if let Some(boundary) = token.replay_until() {
                assert_eq!(boundary, Token::at_position(10));
            }
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while processor.is_replaying() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_start_replay_is_noop() {
        let log = Arc::new(InMemoryEventLog::new());
        seed(&log, 3).await;
        let processor = build(log, Arc::new(InMemoryTokenStore::new()), Dispatcher::new("g"));

        processor.start_replay(Token::TAIL).await.unwrap();
        processor.start_replay(Token::TAIL).await.unwrap();
        assert_eq!(processor.transition_count(), 1);
        assert_eq!(processor.mode(), ProcessorMode::Pull);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_replay_is_idempotent() {
        let log = Arc::new(InMemoryEventLog::new());
        let processor = build(log, Arc::new(InMemoryTokenStore::new()), Dispatcher::new("g"));

        processor.stop_replay().await.unwrap();
        assert_eq!(processor.transition_count(), 0);

        processor.start_replay(Token::TAIL).await.unwrap();
        processor.stop_replay().await.unwrap();
        processor.stop_replay().await.unwrap();
        assert_eq!(processor.mode(), ProcessorMode::Push);
        assert_eq!(processor.transition_count(), 2);
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_reset_refusal_reverts_to_push() {
        let log = Arc::new(InMemoryEventLog::new());
        seed(&log, 4).await;
        let store = Arc::new(InMemoryTokenStore::new());
        let processor = build(
            log,
            store.clone(),
            Dispatcher::new("g").with_handler(Arc::new(RefusesReset)),
        );
        processor.start().await.unwrap();

        let err = processor.start_replay(Token::TAIL).await.unwrap_err();
        assert!(matches!(err, ReplayError::ResetProtocol { .. }));
        assert_eq!(processor.mode(), ProcessorMode::Push);
        assert!(!processor.is_replaying());
        // Nothing was pinned
        assert!(store.tokens("g").await.is_empty());
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_interceptor_forwarded_to_active_half() {
        let log = Arc::new(InMemoryEventLog::new());
        let dispatcher = Dispatcher::new("g");
        let processor = build(log, Arc::new(InMemoryTokenStore::new()), dispatcher.clone());

        let registration =
            processor.register_interceptor(Arc::new(|_: &TrackedEvent, _: &ProcessingContext| true));
        assert_eq!(dispatcher.interceptors().len(), 1);
        assert!(registration.cancel());
        assert!(dispatcher.interceptors().is_empty());
    }

    #[tokio::test]
    async fn test_stop_replay_delivers_unread_events_once() {
        let log = Arc::new(InMemoryEventLog::new());
        seed(&log, 6).await;
        let keys = Arc::new(Keys::default());
        let processor = build(
            log.clone(),
            Arc::new(InMemoryTokenStore::new()),
            Dispatcher::new("g").with_handler(keys.clone()),
        );
        processor.start().await.unwrap();
        processor.start_replay(Token::TAIL).await.unwrap();

        // Appended past the boundary and switched back before the workers
        // are guaranteed to have read them.
        for key in ["late-0", "late-1", "late-2"] {
            log.publish(EventPayload::domain("T", key, json!({}))).await.unwrap();
        }
        processor.stop_replay().await.unwrap();
        log.publish(EventPayload::domain("T", "after", json!({}))).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while keys.count("after") == 0 {
            assert!(Instant::now() < deadline, "live event after switch-back not delivered");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        for key in ["late-0", "late-1", "late-2", "after"] {
            assert_eq!(keys.count(key), 1, "{} delivered {} times", key, keys.count(key));
            assert!(!keys.replayed(key), "{} flagged as replay", key);
        }
        for i in 0..6 {
            assert!(keys.count(&format!("k{}", i)) <= 1);
        }
        processor.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_replay_after_shutdown_keeps_push_stopped() {
        let log = Arc::new(InMemoryEventLog::new());
        seed(&log, 3).await;
        let processor = build(log, Arc::new(InMemoryTokenStore::new()), Dispatcher::new("g"));
        processor.start().await.unwrap();
        processor.start_replay(Token::TAIL).await.unwrap();

        processor.shutdown().await;
        assert!(processor.is_terminated());

        processor.stop_replay().await.unwrap();
        assert_eq!(processor.mode(), ProcessorMode::Push);
        assert!(!processor.push.is_running().await);
        assert!(!processor.pull.is_running().await);

        let err = processor.start().await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
        assert!(!processor.push.is_running().await);
    }
}
