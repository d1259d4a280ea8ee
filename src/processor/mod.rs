// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event processors.
//!
//! A processing group is run by one of three processors:
//!
//! - [`PushProcessor`]: subscribes to the log's live broadcast. Low latency,
//!   no position, cannot replay.
//! - [`PullProcessor`]: one worker per segment reading from a persisted
//!   [`SegmentToken`](crate::token::SegmentToken). Can be rewound.
//! - [`ReplayCapableProcessor`]: owns one of each and switches between them
//!   on an atomic mode cell.
//!
//! All three share a [`Dispatcher`], which owns the group's handlers, its
//! interceptor chain and the message monitor. Push and pull halves of a
//! switching group are built from clones of the same dispatcher, so the
//! interceptor chain survives mode switches.
//!
//! # Dispatch
//!
//! ```text
//! monitor.on_message_ingested(msg) ──► callback
//!        │
//!        ├── replay marker ─────────────────────────► Ignored
//!        ├── interceptor veto ──────────────────────► Ignored
//!        ├── any handler error ─────────────────────► Failed
//!        └── otherwise ─────────────────────────────► Succeeded
//! ```
//!
//! The outcome is returned as an [`Ingestion`] so pull workers can advance
//! their segment token before reporting it.

pub mod pull;
pub mod push;
pub mod replay;

pub use pull::PullProcessor;
pub use push::PushProcessor;
pub use replay::{ActiveProcessor, ReplayCapableProcessor};

use crate::error::{ReplayError, Result};
use crate::event::TrackedEvent;
use crate::handler::{EventHandler, InterceptorChain, ProcessingContext};
use crate::metrics;
use crate::monitor::{IngestionOutcome, MessageMonitor, MonitorCallback, NoOpMessageMonitor};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which half of a processor is consuming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorMode {
    Push = 0,
    Pull = 1,
}

impl ProcessorMode {
    pub(crate) const fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        if raw == ProcessorMode::Pull as u8 {
            ProcessorMode::Pull
        } else {
            ProcessorMode::Push
        }
    }

    /// Lowercase label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorMode::Push => "push",
            ProcessorMode::Pull => "pull",
        }
    }
}

impl std::fmt::Display for ProcessorMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ingested event whose outcome has not been reported yet.
pub(crate) struct Ingestion {
    callback: Arc<dyn MonitorCallback>,
    outcome: IngestionOutcome,
}

impl Ingestion {
    pub(crate) fn outcome(&self) -> &IngestionOutcome {
        &self.outcome
    }

    /// Hand the outcome to the monitor callback.
    pub(crate) fn report(self) {
        self.callback.report(&self.outcome);
    }
}

/// Handlers, interceptors and monitor of one processing group.
#[derive(Clone)]
pub struct Dispatcher {
    group: String,
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
    interceptors: InterceptorChain,
    monitor: Arc<dyn MessageMonitor>,
}

impl Dispatcher {
    /// Dispatcher with no handlers and a no-op monitor.
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            handlers: Arc::new(Vec::new()),
            interceptors: InterceptorChain::new(),
            monitor: Arc::new(NoOpMessageMonitor),
        }
    }

    /// Add a handler. Handlers run in the order they were added.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).push(handler);
        self
    }

    /// Add several handlers.
    pub fn with_handlers(mut self, handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>) -> Self {
        Arc::make_mut(&mut self.handlers).extend(handlers);
        self
    }

    /// Replace the message monitor.
    pub fn with_monitor(mut self, monitor: Arc<dyn MessageMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn interceptors(&self) -> &InterceptorChain {
        &self.interceptors
    }

    /// Run one event through monitor, interceptors and handlers.
    pub(crate) async fn process(
        &self,
        event: &TrackedEvent,
        ctx: &ProcessingContext,
        mode: ProcessorMode,
    ) -> Ingestion {
        let callback = self.monitor.on_message_ingested(&event.message);

        let outcome = if event.message.is_replay_marker() {
            IngestionOutcome::Ignored
        } else if !self.interceptors.proceed(event, ctx) {
            debug!(group = %self.group, position = %event.position, "Event vetoed by interceptor");
            IngestionOutcome::Ignored
        } else {
            self.invoke_handlers(event, ctx).await
        };

        metrics::record_event_processed(&self.group, mode.as_str(), outcome.label());
        Ingestion { callback, outcome }
    }

    async fn invoke_handlers(&self, event: &TrackedEvent, ctx: &ProcessingContext) -> IngestionOutcome {
        for handler in self.handlers.iter() {
            if let Err(e) = handler.handle(event, ctx).await {
                warn!(
                    group = %self.group,
                    handler = handler.name(),
                    position = %event.position,
                    segment = ?ctx.segment,
                    error = %e,
                    "Handler failed, skipping event"
                );
                metrics::record_error(&self.group, "handler");
                return IngestionOutcome::Failed(e.to_string());
            }
        }
        IngestionOutcome::Succeeded
    }

    /// Ask every handler to clear its state before a replay.
    pub(crate) async fn reset_handlers(&self) -> Result<()> {
        for handler in self.handlers.iter() {
            handler.on_reset().await.map_err(|e| {
                ReplayError::reset_protocol(
                    self.group.clone(),
                    format!("handler {} rejected reset: {}", handler.name(), e),
                )
            })?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("group", &self.group)
            .field("handlers", &self.handlers.len())
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}
