// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message monitoring and replay-marker routing.
//!
//! Every processor consults a [`MessageMonitor`] when it ingests a message
//! and reports the outcome (succeeded, failed, ignored) to the returned
//! [`MonitorCallback`].
//!
//! [`MarkerRoutingMonitor`] is a pure classification step: for replay
//! markers it returns the coordinator's [`ReplaySignal`], for everything
//! else a no-op callback. It never looks past the payload kind.
//!
//! # Marker delivery is a hint
//!
//! A marker is ingested once per consuming segment, possibly by several
//! groups, and outcomes may arrive in any order. Each outcome is only a
//! trigger for the coordinator to re-check segment status; it is never
//! the authority on whether a replay has caught up.

use crate::event::EventMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// How the ingestion of a message ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionOutcome {
    Succeeded,
    Failed(String),
    Ignored,
}

impl IngestionOutcome {
    /// Label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            IngestionOutcome::Succeeded => "succeeded",
            IngestionOutcome::Failed(_) => "failed",
            IngestionOutcome::Ignored => "ignored",
        }
    }
}

/// Receives the outcome of one ingested message.
pub trait MonitorCallback: Send + Sync + 'static {
    fn report_success(&self);

    fn report_failure(&self, cause: &str);

    fn report_ignored(&self);

    /// Dispatch an outcome to the matching report method.
    fn report(&self, outcome: &IngestionOutcome) {
        match outcome {
            IngestionOutcome::Succeeded => self.report_success(),
            IngestionOutcome::Failed(cause) => self.report_failure(cause),
            IngestionOutcome::Ignored => self.report_ignored(),
        }
    }
}

/// Callback that discards every outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMonitorCallback;

impl MonitorCallback for NoOpMonitorCallback {
    fn report_success(&self) {}

    fn report_failure(&self, _cause: &str) {}

    fn report_ignored(&self) {}
}

/// Decides which callback observes a message.
pub trait MessageMonitor: Send + Sync + 'static {
    fn on_message_ingested(&self, message: &EventMessage) -> Arc<dyn MonitorCallback>;
}

/// Monitor that observes nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMessageMonitor;

impl MessageMonitor for NoOpMessageMonitor {
    fn on_message_ingested(&self, _message: &EventMessage) -> Arc<dyn MonitorCallback> {
        Arc::new(NoOpMonitorCallback)
    }
}

/// The coordinator's outcome receiver.
///
/// Outcomes are forwarded over an unbounded channel and drained by the
/// coordinator's completion listener task, so the consuming worker never
/// runs the finalize path itself (finalize shuts that worker down).
#[derive(Debug, Clone)]
pub struct ReplaySignal {
    tx: mpsc::UnboundedSender<IngestionOutcome>,
}

impl ReplaySignal {
    /// Create a signal and the receiver the coordinator listens on.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IngestionOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, outcome: IngestionOutcome) {
        trace!(outcome = outcome.label(), "Replay marker ingested");
        crate::metrics::record_marker_outcome(outcome.label());
        // Listener gone means the engine is shutting down.
        let _ = self.tx.send(outcome);
    }
}

impl MonitorCallback for ReplaySignal {
    fn report_success(&self) {
        self.forward(IngestionOutcome::Succeeded);
    }

    fn report_failure(&self, cause: &str) {
        self.forward(IngestionOutcome::Failed(cause.to_string()));
    }

    fn report_ignored(&self) {
        self.forward(IngestionOutcome::Ignored);
    }
}

/// Routes replay markers to the coordinator, everything else to a no-op.
pub struct MarkerRoutingMonitor {
    receiver: Arc<dyn MonitorCallback>,
    noop: Arc<dyn MonitorCallback>,
}

impl MarkerRoutingMonitor {
    pub fn new(receiver: Arc<dyn MonitorCallback>) -> Self {
        Self {
            receiver,
            noop: Arc::new(NoOpMonitorCallback),
        }
    }
}

impl MessageMonitor for MarkerRoutingMonitor {
    fn on_message_ingested(&self, message: &EventMessage) -> Arc<dyn MonitorCallback> {
        if message.is_replay_marker() {
            Arc::clone(&self.receiver)
        } else {
            Arc::clone(&self.noop)
        }
    }
}
