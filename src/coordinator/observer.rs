// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay completion observers.
//!
//! Observers are notified once per finalized session, after every target
//! has been switched back to push mode. A failing observer is logged and
//! counted; it never blocks finalize or the other observers.

use super::ReplaySession;
use std::future::Future;
use std::pin::Pin;

/// Boxed observer future.
pub type ObserverFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<(), ObserverError>> + Send + 'a>>;

/// Error returned by an observer.
#[derive(Debug, Clone)]
pub struct ObserverError(pub String);

impl std::fmt::Display for ObserverError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ObserverError {}

/// Notified when a replay session completes.
pub trait ReplayCompletionObserver: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str {
        "observer"
    }

    fn on_replay_completed<'a>(&'a self, session: &'a ReplaySession) -> ObserverFuture<'a>;
}
