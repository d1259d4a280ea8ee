//! # Replay Engine
//!
//! Live replay for event-sourced processing groups.
//!
//! ## Architecture
//!
//! Each processing group normally consumes the event log in push mode:
//! a live subscription with no stored position. A replay switches the
//! selected groups to pull mode, rewinds their segment tokens and re-reads
//! history, then switches them back once they have caught up:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                             replay-engine                                 │
//! │                                                                           │
//! │  ┌───────────────────┐   ┌──────────────────┐   ┌──────────────────────┐  │
//! │  │ ReplayCoordinator │──►│ ReplayCapable    │──►│ Dispatcher           │  │
//! │  │ (one session)     │   │ Processor        │   │ (interceptors,       │  │
//! │  └───────────────────┘   │ push ◄──► pull   │   │  handlers, monitor)  │  │
//! │           ▲              └──────────────────┘   └──────────────────────┘  │
//! │           │                       │                        │              │
//! │  ReplaySignal ◄── marker ─────────┼────────────────────────┘              │
//! │                                   ▼                                       │
//! │                        ┌────────────────────┐                             │
//! │                        │ SegmentTokenStore  │                             │
//! │                        │ (SQLite)           │                             │
//! │                        └────────────────────┘                             │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Replay Lifecycle
//!
//! 1. **Start**: every target is switched to pull mode. Its segments are
//!    pinned to the current log head and rewound to the start token.
//! 2. **Marker**: one replay marker is published to the log. Each group
//!    ingests it like any other event.
//! 3. **Finalize**: on marker ingestion, if no target is still behind its
//!    pinned boundary, every target is switched back to push mode and the
//!    completion observers run.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use replay_engine::{InMemoryEventLog, ProcessingGroupConfig, ReplayConfig, ReplayEngine, StartReplayRequest};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut config = ReplayConfig::default();
//!     config.processing_groups.push(ProcessingGroupConfig::switching("organizations", 4));
//!
//!     let mut engine = ReplayEngine::new(config, Arc::new(InMemoryEventLog::new()));
//!     engine.start().await.expect("Failed to start");
//!
//!     engine.start_replay(StartReplayRequest::all()).await.expect("Failed to start replay");
//!
//!     engine.shutdown().await;
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod event;
pub mod event_log;
pub mod handler;
pub mod metrics;
pub mod monitor;
pub mod processor;
pub mod token;
pub mod token_store;

// Re-exports for convenience
pub use config::{ProcessingGroupConfig, ProcessorType, PullConfig, PushConfig, ReplayConfig, ReplaySettings, TokenStoreConfig};
pub use coordinator::{
    ObserverError, ReplayCompletionObserver, ReplayCoordinator, ReplaySession, ReplayStatus, StartReplayRequest,
};
pub use engine::{EngineState, GroupHealth, GroupProcessor, HealthCheck, ReplayEngine};
pub use error::{ReplayError, Result};
pub use event::{EventMessage, EventPayload, ReplayMarker, TrackedEvent};
pub use event_log::{EventLog, InMemoryEventLog};
pub use handler::{EventHandler, HandlerError, HandlerInterceptor, ProcessingContext, Registration};
pub use monitor::{IngestionOutcome, MarkerRoutingMonitor, MessageMonitor, MonitorCallback, ReplaySignal};
pub use processor::{Dispatcher, ProcessorMode, PullProcessor, PushProcessor, ReplayCapableProcessor};
pub use token::{SegmentToken, Token};
pub use token_store::{InMemoryTokenStore, SegmentTokenStore, SqliteTokenStore};
