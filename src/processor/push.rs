// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push-mode processor.
//!
//! Subscribes to the event log's live broadcast and dispatches every event
//! as it is appended. Keeps no position: events appended while the
//! processor is stopped are never seen by it.
//!
//! # Lagging
//!
//! The broadcast channel is bounded. A subscriber that falls behind loses
//! the oldest events; this is logged at warn and counted in
//! `replay_push_lagged_events_total`.

use super::{Dispatcher, ProcessorMode};
use crate::config::PushConfig;
use crate::error::Result;
use crate::event::TrackedEvent;
use crate::event_log::EventLog;
use crate::handler::{HandlerInterceptor, ProcessingContext, Registration};
use crate::metrics;
use crate::token::Token;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, warn, Instrument};

struct RunningPush {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Processor delivering live events as soon as they are appended.
pub struct PushProcessor {
    dispatcher: Dispatcher,
    event_log: Arc<dyn EventLog>,
    config: PushConfig,
    running: Mutex<Option<RunningPush>>,
}

impl PushProcessor {
    pub fn new(dispatcher: Dispatcher, event_log: Arc<dyn EventLog>, config: PushConfig) -> Self {
        Self {
            dispatcher,
            event_log,
            config,
            running: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.dispatcher.group()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Subscribe and start delivering. Events appended after this returns
    /// are delivered. No-op if already running.
    pub async fn start(&self) -> Result<()> {
        // Subscribe before spawning so nothing published after start() is missed.
        self.start_after(self.event_log.subscribe(), Token::TAIL).await
    }

    /// Start delivering from a receiver subscribed earlier, skipping events
    /// at or before `delivered_through`. No-op if already running.
    pub async fn start_after(
        &self,
        events: broadcast::Receiver<TrackedEvent>,
        delivered_through: Token,
    ) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            debug!(group = %self.name(), "Push processor already running");
            return Ok(());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dispatcher = self.dispatcher.clone();
        let span = info_span!("push", group = %self.name());
        let handle = tokio::spawn(
            run_subscription(dispatcher, events, delivered_through, shutdown_rx).instrument(span),
        );

        *running = Some(RunningPush { shutdown_tx, handle });
        info!(group = %self.name(), after = %delivered_through, "Push processor started");
        Ok(())
    }

    /// Stop delivering and wait for the subscription task. No-op if stopped.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        let _ = running.shutdown_tx.send(true);

        let mut handle = running.handle;
        let timeout = self.config.shutdown_timeout_duration();
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => debug!(group = %self.name(), "Push subscription stopped"),
            Ok(Err(e)) => warn!(group = %self.name(), error = %e, "Push subscription panicked"),
            Err(_) => {
                warn!(group = %self.name(), ?timeout, "Push subscription did not stop in time, aborting");
                handle.abort();
            }
        }
        info!(group = %self.name(), "Push processor stopped");
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        self.dispatcher.interceptors().register(interceptor)
    }
}

async fn run_subscription(
    dispatcher: Dispatcher,
    mut events: broadcast::Receiver<TrackedEvent>,
    delivered_through: Token,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let ctx = ProcessingContext::live(dispatcher.group());

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            received = events.recv() => match received {
                Ok(event) if event.position <= delivered_through => {
                    trace!(position = %event.position, "Skipping event delivered before subscription");
                }
                Ok(event) => {
                    dispatcher.process(&event, &ctx, ProcessorMode::Push).await.report();
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Push subscriber lagged, events dropped");
                    metrics::record_push_lagged(dispatcher.group(), skipped);
                }
                Err(RecvError::Closed) => {
                    info!("Event log closed live channel");
                    break;
                }
            }
        }
    }
}
