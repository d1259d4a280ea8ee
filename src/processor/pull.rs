// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pull-mode processor.
//!
//! Runs one worker task per segment. Each worker reads batches from the
//! event log strictly after its segment token, dispatches the events it
//! owns, and persists the token once per batch.
//!
//! # Ownership
//!
//! Domain events belong to exactly one segment (hash of the sequence key,
//! see [`segment_for_key`](crate::event::segment_for_key)). Replay markers
//! are ingested by every segment, so each segment reports the marker once
//! it has read past it.
//!
//! # Token Advance Before Report
//!
//! For every event the worker advances its in-memory token (collapsing a
//! composite reset token at the boundary) and only then reports the outcome
//! to the monitor. A completion check triggered by that report therefore
//! sees this segment's up-to-date replay status.
//!
//! # Shutdown
//!
//! Workers stop at the next event boundary, persist their token and exit.
//! Shutdown waits up to `shutdown_timeout` per worker and aborts stragglers
//! so a later reset cannot be overwritten by a late persist.

use super::{Dispatcher, ProcessorMode};
use crate::config::PullConfig;
use crate::error::{ReplayError, Result};
use crate::event_log::EventLog;
use crate::handler::{HandlerInterceptor, ProcessingContext, Registration};
use crate::metrics;
use crate::token::{SegmentToken, Token};
use crate::token_store::SegmentTokenStore;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

/// Backoff after a failed read, doubled per consecutive failure.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MAX_READ_ERROR_BACKOFF: Duration = Duration::from_secs(30);

type SegmentStatuses = Arc<RwLock<BTreeMap<u32, SegmentToken>>>;

struct RunningPull {
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<(u32, JoinHandle<()>)>,
}

/// Segmented, checkpointed processor.
pub struct PullProcessor {
    dispatcher: Dispatcher,
    event_log: Arc<dyn EventLog>,
    token_store: Arc<dyn SegmentTokenStore>,
    segment_count: u32,
    config: PullConfig,
    statuses: SegmentStatuses,
    running: Mutex<Option<RunningPull>>,
}

impl PullProcessor {
    pub fn new(
        dispatcher: Dispatcher,
        event_log: Arc<dyn EventLog>,
        token_store: Arc<dyn SegmentTokenStore>,
        segment_count: u32,
        config: PullConfig,
    ) -> Self {
        Self {
            dispatcher,
            event_log,
            token_store,
            segment_count: segment_count.max(1),
            config,
            statuses: Arc::new(RwLock::new(BTreeMap::new())),
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.dispatcher.group()
    }

    /// Configured number of segments (used when none exist yet).
    pub fn segment_count(&self) -> u32 {
        self.segment_count
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// In-memory token of every known segment.
    pub fn processing_status(&self) -> BTreeMap<u32, SegmentToken> {
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether any segment is still behind its pinned boundary.
    pub fn any_replaying(&self) -> bool {
        self.statuses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .any(SegmentToken::is_replaying)
    }

    /// Load segment tokens and spawn one worker per segment.
    ///
    /// Segments are initialized at the tail if the group has none. No-op if
    /// already running.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(group = %self.name(), "Pull processor already running");
            return Ok(());
        }

        let segments = self
            .token_store
            .initialize_segments(self.name(), self.segment_count, SegmentToken::tracking(Token::TAIL))
            .await?;
        let mut loaded = BTreeMap::new();
        for segment in &segments {
            let token = self
                .token_store
                .fetch_token(self.name(), *segment)
                .await?
                .unwrap_or_else(|| SegmentToken::tracking(Token::TAIL));
            loaded.insert(*segment, token);
        }
        *self.statuses.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = loaded.clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let owner_count = segments.len() as u32;
        let mut workers = Vec::with_capacity(segments.len());
        for (segment, token) in loaded {
            let worker = SegmentWorker {
                dispatcher: self.dispatcher.clone(),
                event_log: Arc::clone(&self.event_log),
                token_store: Arc::clone(&self.token_store),
                statuses: Arc::clone(&self.statuses),
                segment,
                owner_count,
                batch_size: self.config.batch_size.max(1),
                poll_interval: self.config.poll_interval_duration(),
            };
            let span = info_span!("pull", group = %self.name(), segment);
            let handle = tokio::spawn(worker.run(token, shutdown_rx.clone()).instrument(span));
            workers.push((segment, handle));
        }

        info!(group = %self.name(), segments = workers.len(), "Pull processor started");
        *running = Some(RunningPull { shutdown_tx, workers });
        Ok(())
    }

    /// Stop all segment workers. No-op if stopped.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        let timeout = self.config.shutdown_timeout_duration();
        for (segment, mut handle) in running.workers {
            match tokio::time::timeout(timeout, &mut handle).await {
                Ok(Ok(())) => debug!(group = %self.name(), segment, "Segment worker stopped"),
                Ok(Err(e)) => warn!(group = %self.name(), segment, error = %e, "Segment worker panicked"),
                Err(_) => {
                    warn!(group = %self.name(), segment, ?timeout, "Segment worker did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        info!(group = %self.name(), "Pull processor stopped");
    }

    /// Rewind every segment to `start`, replaying until `pinned`.
    ///
    /// Handlers are reset first; then all segments are pinned at `pinned`
    /// and overwritten with the composite reset token, each step a single
    /// atomic store operation. Refused while workers are running.
    pub async fn reset_tokens(&self, start: Token, pinned: Token) -> Result<Vec<(u32, SegmentToken)>> {
        let running = self.running.lock().await;
        if running.is_some() {
            return Err(ReplayError::InvalidState {
                expected: "pull processor stopped".to_string(),
                actual: "running".to_string(),
            });
        }

        self.dispatcher.reset_handlers().await?;

        let segments = self
            .token_store
            .pin_segments(self.name(), self.segment_count, pinned)
            .await?;
        let composite = SegmentToken::reset(start, pinned);
        let tokens: Vec<(u32, SegmentToken)> = segments.iter().map(|s| (*s, composite)).collect();
        self.token_store.store_tokens(self.name(), tokens.clone()).await?;

        *self.statuses.write().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            tokens.iter().copied().collect();

        info!(
            group = %self.name(),
            start = %start,
            pinned = %pinned,
            segments = tokens.len(),
            "Segment tokens reset"
        );
        drop(running);
        Ok(tokens)
    }

    /// Deliver as live events everything up to `head` that no segment has
    /// handled yet. Returns the number of events delivered.
    ///
    /// A segment has handled everything up to its token position, and
    /// everything up to its replay boundary (those events were delivered
    /// live before the reset). Domain events are checked against their
    /// owning segment, replay markers against every segment. Refused while
    /// workers are running.
    pub async fn catch_up_to(&self, head: Token) -> Result<usize> {
        if self.is_running().await {
            return Err(ReplayError::InvalidState {
                expected: "pull processor stopped".to_string(),
                actual: "running".to_string(),
            });
        }

        let handled_through: BTreeMap<u32, Token> = self
            .processing_status()
            .into_iter()
            .map(|(segment, token)| (segment, token.replay_until().unwrap_or(Token::TAIL).max(token.position())))
            .collect();
        let (Some(lowest), Some(highest)) = (
            handled_through.values().min().copied(),
            handled_through.values().max().copied(),
        ) else {
            return Ok(0);
        };

        let owner_count = handled_through.len() as u32;
        let ctx = ProcessingContext::live(self.name());
        let mut cursor = lowest;
        let mut delivered = 0;
        while cursor < head {
            let batch = self.event_log.read_after(cursor, self.config.batch_size.max(1)).await?;
            let Some(last) = batch.last().map(|e| e.position) else {
                break;
            };
            cursor = last;

            for event in batch.into_iter().take_while(|e| e.position <= head) {
                let handled = if event.message.is_replay_marker() {
                    event.position <= highest
                } else {
                    handled_through
                        .get(&event.segment(owner_count))
                        .is_some_and(|through| event.position <= *through)
                };
                if handled {
                    continue;
                }
                self.dispatcher.process(&event, &ctx, ProcessorMode::Push).await.report();
                delivered += 1;
            }
        }

        debug!(group = %self.name(), from = %lowest, through = %head, delivered, "Caught up with the log head");
        Ok(delivered)
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        self.dispatcher.interceptors().register(interceptor)
    }
}

/// One segment's consumption loop.
struct SegmentWorker {
    dispatcher: Dispatcher,
    event_log: Arc<dyn EventLog>,
    token_store: Arc<dyn SegmentTokenStore>,
    statuses: SegmentStatuses,
    segment: u32,
    owner_count: u32,
    batch_size: usize,
    poll_interval: Duration,
}

impl SegmentWorker {
    async fn run(self, mut token: SegmentToken, mut shutdown_rx: watch::Receiver<bool>) {
        let group = self.dispatcher.group().to_string();
        info!(token = %token, "Starting segment worker");

        let mut read_backoff = READ_ERROR_BACKOFF;

        'consume: loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let batch_start = Instant::now();
            let batch = match self.event_log.read_after(token.position(), self.batch_size).await {
                Ok(batch) => {
                    read_backoff = READ_ERROR_BACKOFF;
                    batch
                }
                Err(e) => {
                    warn!(error = %e, backoff = ?read_backoff, "Event log read failed");
                    metrics::record_error(&group, e.kind());
                    if wait_or_shutdown(&mut shutdown_rx, read_backoff).await {
                        break;
                    }
                    read_backoff = (read_backoff * 2).min(MAX_READ_ERROR_BACKOFF);
                    continue;
                }
            };

            if batch.is_empty() {
                if wait_or_shutdown(&mut shutdown_rx, self.poll_interval).await {
                    break;
                }
                continue;
            }

            let read = batch.len();
            for event in batch {
                let owned = event.message.is_replay_marker() || event.segment(self.owner_count) == self.segment;
                let ingestion = if owned {
                    let ctx = ProcessingContext::segment(group.as_str(), self.segment, token.is_replay_of(event.position));
                    Some(self.dispatcher.process(&event, &ctx, ProcessorMode::Pull).await)
                } else {
                    None
                };

                let was_replaying = token.is_replaying();
                token = token.advance_to(event.position);
                self.publish_status(token);
                if was_replaying && !token.is_replaying() {
                    info!(position = %token.position(), "Segment caught up with replay boundary");
                }

                if let Some(ingestion) = ingestion {
                    trace!(position = %event.position, outcome = ingestion.outcome().label(), "Event ingested");
                    ingestion.report();
                }

                if *shutdown_rx.borrow() {
                    self.persist(&group, token).await;
                    break 'consume;
                }
            }

            self.persist(&group, token).await;
            metrics::record_batch_processed(&group, self.segment, read, batch_start.elapsed());
            metrics::record_segment_position(&group, self.segment, token.position().position(), token.replay_remaining());
            debug!(read, token = %token, "Batch processed");
        }

        self.persist(&group, token).await;
        info!(token = %token, "Segment worker stopped");
    }

    fn publish_status(&self, token: SegmentToken) {
        self.statuses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(self.segment, token);
    }

    async fn persist(&self, group: &str, token: SegmentToken) {
        match self.token_store.store_token(group, self.segment, token).await {
            Ok(()) => metrics::record_token_persist(group, true),
            Err(e) => {
                warn!(error = %e, token = %token, "Failed to persist segment token");
                metrics::record_token_persist(group, false);
            }
        }
    }
}

/// Sleep for `duration` unless shutdown is signaled first.
/// Returns `true` if the worker should stop.
async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        changed = shutdown_rx.changed() => changed.is_err() || *shutdown_rx.borrow(),
        _ = tokio::time::sleep(duration) => false,
    }
}
