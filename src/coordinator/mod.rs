// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay coordinator.
//!
//! The single control surface for replays. Owns at most one
//! [`ReplaySession`] system-wide and drives it to completion:
//!
//! 1. `start_replay`: switch every target to pull mode (reset protocol),
//!    record the session, publish one replay marker
//! 2. marker ingestion anywhere triggers a completion check
//! 3. once no target reports replaying: switch every target back to push,
//!    notify observers, clear the session
//!
//! # Locking
//!
//! `start_replay` and `on_marker_ingested` run inside the same
//! `tokio::sync::Mutex`, so a start and a finalize never interleave and a
//! second start is rejected with [`ReplayError::AlreadyReplaying`].
//!
//! # Outcome Delivery
//!
//! Marker outcomes reach the coordinator through a [`ReplaySignal`]
//! channel drained by [`ReplayCoordinator::spawn_completion_listener`].
//! Finalize shuts down pull workers, so it must never run on one of them.
//!
//! [`ReplaySignal`]: crate::monitor::ReplaySignal

mod observer;
mod types;

pub use observer::{ObserverError, ObserverFuture, ReplayCompletionObserver};
pub use types::{ReplaySession, ReplayStatus, StartReplayRequest};

use crate::error::{ReplayError, Result};
use crate::event::{EventPayload, ReplayMarker};
use crate::event_log::EventLog;
use crate::metrics;
use crate::monitor::IngestionOutcome;
use crate::processor::ReplayCapableProcessor;
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

struct ActiveSession {
    session: ReplaySession,
    targets: Vec<Arc<ReplayCapableProcessor>>,
}

/// Clears the session slot when dropped, however finalize exits.
struct ClearOnDrop<'a>(&'a mut Option<ActiveSession>);

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(active) = self.0.take() {
            metrics::clear_session_active();
            debug!(session_id = %active.session.id, "Replay session cleared");
        }
    }
}

/// Single-session replay control plane.
pub struct ReplayCoordinator {
    processors: Vec<Arc<ReplayCapableProcessor>>,
    event_log: Arc<dyn EventLog>,
    observers: Vec<Arc<dyn ReplayCompletionObserver>>,
    session: Mutex<Option<ActiveSession>>,
}

impl ReplayCoordinator {
    pub fn new(
        processors: Vec<Arc<ReplayCapableProcessor>>,
        event_log: Arc<dyn EventLog>,
        observers: Vec<Arc<dyn ReplayCompletionObserver>>,
    ) -> Self {
        Self {
            processors,
            event_log,
            observers,
            session: Mutex::new(None),
        }
    }

    /// Replay-capable processors known to the coordinator.
    pub fn processors(&self) -> &[Arc<ReplayCapableProcessor>] {
        &self.processors
    }

    pub async fn status(&self) -> ReplayStatus {
        ReplayStatus {
            switching_processor_count: self.processors.len(),
            is_replaying: self.session.lock().await.is_some(),
        }
    }

    /// Snapshot of the active session, if any.
    pub async fn active_session(&self) -> Option<ReplaySession> {
        self.session.lock().await.as_ref().map(|a| a.session.clone())
    }

    fn resolve_targets(&self, request: &StartReplayRequest) -> Result<Vec<Arc<ReplayCapableProcessor>>> {
        let targets: Vec<_> = match &request.processing_groups {
            None => self.processors.clone(),
            Some(groups) => self
                .processors
                .iter()
                .filter(|p| groups.contains(p.name()))
                .cloned()
                .collect(),
        };
        if targets.is_empty() {
            return Err(ReplayError::NoMatchingProcessors {
                requested: request.requested_groups(),
            });
        }
        Ok(targets)
    }

    /// Start a replay session.
    ///
    /// Fails with [`ReplayError::AlreadyReplaying`] if a session is active
    /// and [`ReplayError::NoMatchingProcessors`] if the request resolves to
    /// nothing. If any target fails to switch, or the marker cannot be
    /// published, every target already switched is switched back.
    pub async fn start_replay(&self, request: StartReplayRequest) -> Result<ReplaySession> {
        let mut slot = self.session.lock().await;
        if slot.is_some() {
            metrics::record_session_rejected("already_replaying");
            return Err(ReplayError::AlreadyReplaying);
        }

        let targets = match self.resolve_targets(&request) {
            Ok(targets) => targets,
            Err(e) => {
                metrics::record_session_rejected("no_matching_processors");
                return Err(e);
            }
        };

        let start_token = match request.start_time {
            Some(start_time) => self.event_log.at(start_time).await?,
            None => self.event_log.tail().await?,
        };

        let mut switched: Vec<Arc<ReplayCapableProcessor>> = Vec::with_capacity(targets.len());
        for processor in &targets {
            if let Err(e) = processor.start_replay(start_token).await {
                error!(group = %processor.name(), error = %e, "Failed to start replay, rolling back");
                Self::roll_back(&switched).await;
                return Err(e);
            }
            switched.push(Arc::clone(processor));
        }

        let marker = ReplayMarker::new();
        let session = ReplaySession {
            id: marker.id,
            target_groups: targets.iter().map(|p| p.name().to_string()).collect(),
            started_at: Utc::now(),
            start_token,
        };
        *slot = Some(ActiveSession {
            session: session.clone(),
            targets: targets.clone(),
        });

        if let Err(e) = self.event_log.publish(EventPayload::ReplayMarker(marker)).await {
            error!(session_id = %session.id, error = %e, "Failed to publish replay marker, rolling back");
            Self::roll_back(&targets).await;
            *slot = None;
            return Err(e);
        }

        metrics::record_session_started(targets.len());
        info!(
            session_id = %session.id,
            groups = ?session.target_groups,
            start = %start_token,
            "Replay session started"
        );
        Ok(session)
    }

    async fn roll_back(processors: &[Arc<ReplayCapableProcessor>]) {
        for processor in processors {
            if let Err(e) = processor.stop_replay().await {
                warn!(group = %processor.name(), error = %e, "Rollback of replay failed");
            }
        }
    }

    /// Re-check completion after a replay marker was ingested somewhere.
    ///
    /// The outcome itself is only a trigger; completion is decided from the
    /// targets' segment status.
    pub async fn on_marker_ingested(&self, outcome: &IngestionOutcome) {
        let mut slot = self.session.lock().await;
        let Some(active) = slot.as_ref() else {
            debug!(outcome = outcome.label(), "Replay marker ingested with no active session");
            return;
        };

        let still_replaying: Vec<&str> = active
            .targets
            .iter()
            .filter(|p| p.is_replaying())
            .map(|p| p.name())
            .collect();
        if !still_replaying.is_empty() {
            debug!(
                session_id = %active.session.id,
                outcome = outcome.label(),
                pending = ?still_replaying,
                "Replay marker ingested, targets still replaying"
            );
            metrics::record_completion_check(still_replaying.len());
            return;
        }

        self.finalize(&mut slot).await;
    }

    async fn finalize(&self, slot: &mut Option<ActiveSession>) {
        let guard = ClearOnDrop(slot);
        let Some(active) = guard.0.as_ref() else {
            return;
        };
        let session = &active.session;
        info!(session_id = %session.id, groups = ?session.target_groups, "Replay caught up, finalizing");

        for processor in &active.targets {
            if let Err(e) = processor.stop_replay().await {
                error!(group = %processor.name(), error = %e, "Failed to switch back to push mode");
                metrics::record_error(processor.name(), e.kind());
            }
        }

        for observer in &self.observers {
            let notified = AssertUnwindSafe(async { observer.on_replay_completed(session).await })
                .catch_unwind()
                .await;
            match notified {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(observer = observer.name(), error = %e, "Replay completion observer failed");
                    metrics::record_observer_failure(observer.name());
                }
                Err(_) => {
                    error!(observer = observer.name(), "Replay completion observer panicked");
                    metrics::record_observer_failure(observer.name());
                }
            }
        }

        let elapsed = (Utc::now() - session.started_at).to_std().unwrap_or_default();
        metrics::record_session_completed(active.targets.len(), elapsed);
        info!(session_id = %session.id, elapsed = ?elapsed, "Replay session completed");
    }

    /// Drain marker outcomes into [`on_marker_ingested`](Self::on_marker_ingested)
    /// until shutdown or until every sender is gone.
    pub fn spawn_completion_listener(
        self: &Arc<Self>,
        mut outcomes: mpsc::UnboundedReceiver<IngestionOutcome>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let span = info_span!("replay_completion");
        tokio::spawn(
            async move {
                debug!("Completion listener started");
                loop {
                    tokio::select! {
                        biased;

                        changed = shutdown_rx.changed() => {
                            if changed.is_err() || *shutdown_rx.borrow() {
                                break;
                            }
                        }

                        outcome = outcomes.recv() => match outcome {
                            Some(outcome) => coordinator.on_marker_ingested(&outcome).await,
                            None => break,
                        }
                    }
                }
                debug!("Completion listener stopped");
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PullConfig, PushConfig};
    use crate::event_log::InMemoryEventLog;
    use crate::processor::{Dispatcher, ProcessorMode, PullProcessor, PushProcessor};
    use crate::token_store::InMemoryTokenStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    impl ReplayCompletionObserver for Counting {
        fn on_replay_completed<'a>(&'a self, _session: &'a ReplaySession) -> ObserverFuture<'a> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }
    }

    fn processor(name: &str, log: Arc<InMemoryEventLog>) -> Arc<ReplayCapableProcessor> {
        let dispatcher = Dispatcher::new(name);
        Arc::new(ReplayCapableProcessor::new(
            PushProcessor::new(dispatcher.clone(), log.clone(), PushConfig::default()),
            PullProcessor::new(
                dispatcher,
                log.clone(),
                Arc::new(InMemoryTokenStore::new()),
                1,
                PullConfig {
                    poll_interval: "5ms".to_string(),
                    ..Default::default()
                },
            ),
            log,
        ))
    }

    #[tokio::test]
    async fn test_status_counts_processors() {
        let log = Arc::new(InMemoryEventLog::new());
        let coordinator = ReplayCoordinator::new(
            vec![processor("a", log.clone()), processor("b", log.clone())],
            log,
            vec![],
        );
        let status = coordinator.status().await;
        assert_eq!(status.switching_processor_count, 2);
        assert!(!status.is_replaying);
        assert!(coordinator.active_session().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_group_rejected() {
        let log = Arc::new(InMemoryEventLog::new());
        let coordinator = ReplayCoordinator::new(vec![processor("a", log.clone())], log, vec![]);

        let err = coordinator
            .start_replay(StartReplayRequest::for_groups(["missing"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplayError::NoMatchingProcessors { ref requested } if requested == &["missing"]));
        assert!(!coordinator.status().await.is_replaying);
    }

    #[tokio::test]
    async fn test_no_processors_rejected() {
        let log = Arc::new(InMemoryEventLog::new());
        let coordinator = ReplayCoordinator::new(vec![], log, vec![]);
        let err = coordinator.start_replay(StartReplayRequest::all()).await.unwrap_err();
        assert!(err.is_operator_error());
    }

    #[tokio::test]
    async fn test_session_publishes_single_marker() {
        let log = Arc::new(InMemoryEventLog::new());
        let coordinator = ReplayCoordinator::new(vec![processor("a", log.clone())], log.clone(), vec![]);

        let session = coordinator.start_replay(StartReplayRequest::all()).await.unwrap();
        assert_eq!(session.target_groups, vec!["a"]);

        let markers: Vec<_> = log
            .snapshot()
            .await
            .into_iter()
            .filter_map(|e| e.message.as_replay_marker().copied())
            .collect();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].id, session.id);

        let err = coordinator.start_replay(StartReplayRequest::all()).await.unwrap_err();
        assert!(matches!(err, ReplayError::AlreadyReplaying));

        for p in coordinator.processors() {
            p.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_marker_without_session_is_noop() {
        let log = Arc::new(InMemoryEventLog::new());
        let observer = Arc::new(Counting(AtomicUsize::new(0)));
        let coordinator = ReplayCoordinator::new(vec![processor("a", log.clone())], log, vec![observer.clone()]);

        coordinator.on_marker_ingested(&IngestionOutcome::Ignored).await;
        assert_eq!(observer.0.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_finalize_switches_back_and_notifies_once() {
        let log = Arc::new(InMemoryEventLog::new());
        let observer = Arc::new(Counting(AtomicUsize::new(0)));
        let target = processor("a", log.clone());
        let coordinator = ReplayCoordinator::new(vec![target.clone()], log, vec![observer.clone()]);

        // Empty log: nothing to replay, the first check finalizes
        coordinator.start_replay(StartReplayRequest::all()).await.unwrap();
        assert_eq!(target.mode(), ProcessorMode::Pull);

        coordinator.on_marker_ingested(&IngestionOutcome::Ignored).await;
        assert_eq!(target.mode(), ProcessorMode::Push);
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        assert!(coordinator.active_session().await.is_none());

        // Late duplicate outcome
        coordinator.on_marker_ingested(&IngestionOutcome::Ignored).await;
        assert_eq!(observer.0.load(Ordering::SeqCst), 1);
        target.shutdown().await;
    }
}
