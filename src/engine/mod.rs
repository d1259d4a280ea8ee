// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay engine.
//!
//! Wires the configured processing groups, the token store and the replay
//! coordinator together and owns their lifecycle.
//!
//! # Architecture
//!
//! ```text
//!                ┌─────────────────────── ReplayEngine ───────────────────────┐
//!                │                                                            │
//!  EventLog ────►│  group (switching) ─ ReplayCapableProcessor ─┐             │
//!                │  group (push)      ─ PushProcessor           ├─ monitor ──┐│
//!                │  group (pull)      ─ PullProcessor ──────────┘            ││
//!                │        │                                                  ││
//!                │        ▼                                     ReplaySignal ││
//!                │  SegmentTokenStore (SQLite)                        │      ││
//!                │                                                    ▼      ││
//!  operator ────►│  ReplayCoordinator ◄──── completion listener ◄─────┘      ││
//!                └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every group shares one [`MarkerRoutingMonitor`], so a replay marker
//! ingested by any group (switching or not) triggers a completion check.
//! Only switching groups are handed to the coordinator.

mod types;

pub use types::{EngineState, GroupHealth, HealthCheck};

use crate::config::{ProcessorType, ReplayConfig};
use crate::coordinator::{ReplayCompletionObserver, ReplayCoordinator, ReplaySession, ReplayStatus, StartReplayRequest};
use crate::error::{ReplayError, Result};
use crate::event_log::EventLog;
use crate::handler::{EventHandler, HandlerInterceptor, Registration};
use crate::metrics;
use crate::monitor::{MarkerRoutingMonitor, MessageMonitor, ReplaySignal};
use crate::processor::{Dispatcher, ProcessorMode, PullProcessor, PushProcessor, ReplayCapableProcessor};
use crate::token::SegmentToken;
use crate::token_store::{SegmentTokenStore, SqliteTokenStore};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each background task.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The processor running one group.
#[derive(Clone)]
pub enum GroupProcessor {
    Switching(Arc<ReplayCapableProcessor>),
    Push(Arc<PushProcessor>),
    Pull(Arc<PullProcessor>),
}

impl GroupProcessor {
    pub fn name(&self) -> &str {
        match self {
            GroupProcessor::Switching(p) => p.name(),
            GroupProcessor::Push(p) => p.name(),
            GroupProcessor::Pull(p) => p.name(),
        }
    }

    pub fn processor_type(&self) -> ProcessorType {
        match self {
            GroupProcessor::Switching(_) => ProcessorType::Switching,
            GroupProcessor::Push(_) => ProcessorType::Push,
            GroupProcessor::Pull(_) => ProcessorType::Pull,
        }
    }

    pub fn mode(&self) -> ProcessorMode {
        match self {
            GroupProcessor::Switching(p) => p.mode(),
            GroupProcessor::Push(_) => ProcessorMode::Push,
            GroupProcessor::Pull(_) => ProcessorMode::Pull,
        }
    }

    pub fn is_replaying(&self) -> bool {
        match self {
            GroupProcessor::Switching(p) => p.is_replaying(),
            GroupProcessor::Push(_) => false,
            GroupProcessor::Pull(p) => p.any_replaying(),
        }
    }

    pub fn processing_status(&self) -> BTreeMap<u32, SegmentToken> {
        match self {
            GroupProcessor::Switching(p) => p.processing_status(),
            GroupProcessor::Push(_) => BTreeMap::new(),
            GroupProcessor::Pull(p) => p.processing_status(),
        }
    }

    /// The replay-capable processor, for switching groups.
    pub fn as_replay_capable(&self) -> Option<&Arc<ReplayCapableProcessor>> {
        match self {
            GroupProcessor::Switching(p) => Some(p),
            _ => None,
        }
    }

    pub async fn start(&self) -> Result<()> {
        match self {
            GroupProcessor::Switching(p) => p.start().await,
            GroupProcessor::Push(p) => p.start().await,
            GroupProcessor::Pull(p) => p.start().await,
        }
    }

    pub async fn shutdown(&self) {
        match self {
            GroupProcessor::Switching(p) => p.shutdown().await,
            GroupProcessor::Push(p) => p.shutdown().await,
            GroupProcessor::Pull(p) => p.shutdown().await,
        }
    }

    pub fn register_interceptor(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        match self {
            GroupProcessor::Switching(p) => p.register_interceptor(interceptor),
            GroupProcessor::Push(p) => p.register_interceptor(interceptor),
            GroupProcessor::Pull(p) => p.register_interceptor(interceptor),
        }
    }
}

/// The replay engine.
pub struct ReplayEngine {
    config: ReplayConfig,

    event_log: Arc<dyn EventLog>,

    /// Injected store, or the one opened from config on start.
    token_store: Option<Arc<dyn SegmentTokenStore>>,

    /// Whether `token_store` was opened by the engine (and must be closed by it).
    owns_token_store: bool,

    handlers: HashMap<String, Vec<Arc<dyn EventHandler>>>,

    observers: Vec<Arc<dyn ReplayCompletionObserver>>,

    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    groups: Vec<GroupProcessor>,

    coordinator: Option<Arc<ReplayCoordinator>>,

    /// Background tasks (completion listener).
    tasks: Vec<JoinHandle<()>>,
}

impl ReplayEngine {
    /// Create an engine in `Created` state. The token store is opened from
    /// `config.token_store` on [`start()`](Self::start) unless one is
    /// injected with [`with_token_store`](Self::with_token_store).
    pub fn new(config: ReplayConfig, event_log: Arc<dyn EventLog>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            event_log,
            token_store: None,
            owns_token_store: false,
            handlers: HashMap::new(),
            observers: Vec::new(),
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            groups: Vec::new(),
            coordinator: None,
            tasks: Vec::new(),
        }
    }

    /// Use an existing token store instead of opening one from config.
    pub fn with_token_store(mut self, token_store: Arc<dyn SegmentTokenStore>) -> Self {
        self.token_store = Some(token_store);
        self.owns_token_store = false;
        self
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    fn require_state(&self, expected: EngineState) -> Result<()> {
        let actual = self.state();
        if actual != expected {
            return Err(ReplayError::InvalidState {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Add a handler to a configured group. Only allowed before start.
    pub fn register_handler(&mut self, group: &str, handler: Arc<dyn EventHandler>) -> Result<()> {
        self.require_state(EngineState::Created)?;
        if self.config.group(group).is_none() {
            return Err(ReplayError::Config(format!("unknown processing group: {}", group)));
        }
        self.handlers.entry(group.to_string()).or_default().push(handler);
        Ok(())
    }

    /// Add a replay completion observer. Only allowed before start.
    pub fn register_observer(&mut self, observer: Arc<dyn ReplayCompletionObserver>) -> Result<()> {
        self.require_state(EngineState::Created)?;
        self.observers.push(observer);
        Ok(())
    }

    /// Add an interceptor to a running group's active processor.
    pub fn register_interceptor(&self, group: &str, interceptor: Arc<dyn HandlerInterceptor>) -> Result<Registration> {
        self.require_state(EngineState::Running)?;
        let processor = self
            .processor(group)
            .ok_or_else(|| ReplayError::Config(format!("unknown processing group: {}", group)))?;
        Ok(processor.register_interceptor(interceptor))
    }

    /// Processor of a group (after start).
    pub fn processor(&self, group: &str) -> Option<&GroupProcessor> {
        self.groups.iter().find(|g| g.name() == group)
    }

    pub fn processors(&self) -> &[GroupProcessor] {
        &self.groups
    }

    /// The replay coordinator (after start).
    pub fn coordinator(&self) -> Option<&Arc<ReplayCoordinator>> {
        self.coordinator.as_ref()
    }

    fn running_coordinator(&self) -> Result<&Arc<ReplayCoordinator>> {
        self.require_state(EngineState::Running)?;
        self.coordinator
            .as_ref()
            .ok_or_else(|| ReplayError::Internal("coordinator missing while running".to_string()))
    }

    /// Start a replay (see [`ReplayCoordinator::start_replay`]).
    pub async fn start_replay(&self, request: StartReplayRequest) -> Result<ReplaySession> {
        self.running_coordinator()?.start_replay(request).await
    }

    /// Replay status (see [`ReplayCoordinator::status`]).
    pub async fn replay_status(&self) -> Result<ReplayStatus> {
        Ok(self.running_coordinator()?.status().await)
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let groups = self
            .groups
            .iter()
            .map(|g| GroupHealth {
                name: g.name().to_string(),
                processor_type: g.processor_type(),
                mode: g.mode(),
                replaying: g.is_replaying(),
                segments: g.processing_status(),
            })
            .collect();
        let replay = match &self.coordinator {
            Some(coordinator) => Some(coordinator.status().await),
            None => None,
        };
        HealthCheck {
            state,
            ready: state == EngineState::Running,
            groups,
            replay,
        }
    }

    /// Start the engine.
    ///
    /// 1. Validates config and opens the token store (SQLite) if none was injected
    /// 2. Builds one processor per group, all sharing the marker routing monitor
    /// 3. Spawns the coordinator's completion listener
    /// 4. Starts every processor (switching groups start in push mode)
    pub async fn start(&mut self) -> Result<()> {
        self.require_state(EngineState::Created)?;

        info!(groups = self.config.processing_groups.len(), "Starting replay engine");
        self.set_state(EngineState::Starting);

        match self.build_and_start().await {
            Ok(()) => {
                self.set_state(EngineState::Running);
                let replay_capable = self.coordinator.as_ref().map(|c| c.processors().len()).unwrap_or(0);
                info!(groups = self.groups.len(), replay_capable, "Replay engine running");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Replay engine failed to start");
                let _ = self.shutdown_tx.send(true);
                for group in &self.groups {
                    group.shutdown().await;
                }
                self.close_token_store().await;
                self.set_state(EngineState::Failed);
                Err(e)
            }
        }
    }

    async fn build_and_start(&mut self) -> Result<()> {
        self.config.validate()?;

        let token_store = match &self.token_store {
            Some(store) => Arc::clone(store),
            None => {
                let store: Arc<dyn SegmentTokenStore> =
                    Arc::new(SqliteTokenStore::open(&self.config.token_store).await?);
                info!(path = %self.config.token_store.sqlite_path, "Token store initialized");
                self.token_store = Some(Arc::clone(&store));
                self.owns_token_store = true;
                store
            }
        };

        let (signal, outcomes) = ReplaySignal::channel();
        let monitor: Arc<dyn MessageMonitor> = Arc::new(MarkerRoutingMonitor::new(Arc::new(signal)));
        let settings = &self.config.settings;

        let mut groups = Vec::with_capacity(self.config.processing_groups.len());
        let mut replay_capable = Vec::new();
        for group in &self.config.processing_groups {
            let handlers = self.handlers.get(&group.name).cloned().unwrap_or_default();
            let dispatcher = Dispatcher::new(group.name.clone())
                .with_handlers(handlers)
                .with_monitor(Arc::clone(&monitor));

            let processor = match group.processor_type {
                ProcessorType::Switching => {
                    let processor = Arc::new(ReplayCapableProcessor::new(
                        PushProcessor::new(dispatcher.clone(), Arc::clone(&self.event_log), settings.push.clone()),
                        PullProcessor::new(
                            dispatcher,
                            Arc::clone(&self.event_log),
                            Arc::clone(&token_store),
                            group.segment_count,
                            settings.pull.clone(),
                        ),
                        Arc::clone(&self.event_log),
                    ));
                    replay_capable.push(Arc::clone(&processor));
                    GroupProcessor::Switching(processor)
                }
                ProcessorType::Push => GroupProcessor::Push(Arc::new(PushProcessor::new(
                    dispatcher,
                    Arc::clone(&self.event_log),
                    settings.push.clone(),
                ))),
                ProcessorType::Pull => GroupProcessor::Pull(Arc::new(PullProcessor::new(
                    dispatcher,
                    Arc::clone(&self.event_log),
                    Arc::clone(&token_store),
                    group.segment_count,
                    settings.pull.clone(),
                ))),
            };
            debug!(group = %group.name, processor_type = ?group.processor_type, "Built processor");
            groups.push(processor);
        }
        self.groups = groups;

        let coordinator = Arc::new(ReplayCoordinator::new(
            replay_capable,
            Arc::clone(&self.event_log),
            self.observers.clone(),
        ));
        self.tasks
            .push(coordinator.spawn_completion_listener(outcomes, self.shutdown_rx.clone()));
        self.coordinator = Some(coordinator);

        for group in &self.groups {
            group.start().await?;
        }
        Ok(())
    }

    async fn close_token_store(&mut self) {
        if !self.owns_token_store {
            return;
        }
        if let Some(store) = self.token_store.take() {
            if let Err(e) = store.close().await {
                warn!(error = %e, "Failed to close token store");
            }
        }
        self.owns_token_store = false;
    }

    /// Shutdown the engine gracefully.
    ///
    /// Shutdown sequence:
    /// 1. Stop the completion listener (with timeout), letting an in-flight
    ///    finalize finish its switch back to push
    /// 2. Stop every processor (pull workers persist their tokens)
    /// 3. Checkpoint and close the token store, if the engine opened it
    ///
    /// A replay session still active at shutdown is abandoned; its segment
    /// tokens stay persisted.
    pub async fn shutdown(&mut self) {
        if matches!(self.state(), EngineState::Stopped | EngineState::ShuttingDown) {
            return;
        }
        info!("Shutting down replay engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        for (i, handle) in std::mem::take(&mut self.tasks).into_iter().enumerate() {
            match tokio::time::timeout(TASK_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        for group in &self.groups {
            group.shutdown().await;
        }

        if let Some(coordinator) = &self.coordinator {
            if let Some(session) = coordinator.active_session().await {
                warn!(session_id = %session.id, "Replay session abandoned by shutdown");
            }
        }

        self.close_token_store().await;

        self.set_state(EngineState::Stopped);
        info!("Replay engine stopped");
    }
}
