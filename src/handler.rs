// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Event handler and interceptor seams.
//!
//! Handlers project events into read models; they are owned by the
//! application, not by this crate. A processor holds a list of handlers
//! and an [`InterceptorChain`]. Interceptors run before the handlers and
//! may veto an event (reported to the monitor as *ignored*).
//!
//! Handlers are told through [`ProcessingContext::replaying`] whether an
//! event is a re-delivery below the pinned replay boundary, and are given
//! a chance to clear their state through [`EventHandler::on_reset`] before
//! a replay starts.

use crate::event::TrackedEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Result type for handler operations.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Boxed handler future.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = HandlerResult<()>> + Send + 'a>>;

/// Simplified error for handler failures.
#[derive(Debug, Clone)]
pub struct HandlerError(pub String);

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for HandlerError {}

/// Where and how an event is being processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingContext {
    /// Processing group name.
    pub group: String,
    /// Pull segment handling the event (`None` in push mode).
    pub segment: Option<u32>,
    /// Whether the event is being re-delivered below the replay boundary.
    pub replaying: bool,
}

impl ProcessingContext {
    /// Context for live push delivery.
    pub fn live(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            segment: None,
            replaying: false,
        }
    }

    /// Context for a pull segment.
    pub fn segment(group: impl Into<String>, segment: u32, replaying: bool) -> Self {
        Self {
            group: group.into(),
            segment: Some(segment),
            replaying,
        }
    }
}

/// An application event handler.
pub trait EventHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }

    /// Handle one event. Replay markers are never passed here.
    fn handle<'a>(&'a self, event: &'a TrackedEvent, ctx: &'a ProcessingContext) -> HandlerFuture<'a>;

    /// Called once before a replay rewinds the group's segments.
    ///
    /// Handlers that own a projection should clear it here. An error aborts
    /// the replay for the group.
    fn on_reset(&self) -> HandlerFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// Runs before handlers; returning `false` skips the event.
pub trait HandlerInterceptor: Send + Sync + 'static {
    fn intercept(&self, event: &TrackedEvent, ctx: &ProcessingContext) -> bool;
}

impl<F> HandlerInterceptor for F
where
    F: Fn(&TrackedEvent, &ProcessingContext) -> bool + Send + Sync + 'static,
{
    fn intercept(&self, event: &TrackedEvent, ctx: &ProcessingContext) -> bool {
        self(event, ctx)
    }
}

#[derive(Default)]
struct ChainInner {
    entries: RwLock<Vec<(u64, Arc<dyn HandlerInterceptor>)>>,
    next_id: AtomicU64,
}

/// Ordered, shareable list of interceptors.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    inner: Arc<ChainInner>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an interceptor. Dropping the returned [`Registration`] does
    /// not remove it; call [`Registration::cancel`].
    pub fn register(&self, interceptor: Arc<dyn HandlerInterceptor>) -> Registration {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((id, interceptor));
        Registration {
            id,
            chain: Arc::downgrade(&self.inner),
        }
    }

    /// Run every interceptor in registration order; stops at the first veto.
    pub fn proceed(&self, event: &TrackedEvent, ctx: &ProcessingContext) -> bool {
        let entries = self
            .inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.iter().all(|(_, interceptor)| interceptor.intercept(event, ctx))
    }

    /// Number of registered interceptors.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registered interceptor.
#[derive(Debug)]
pub struct Registration {
    id: u64,
    chain: Weak<ChainInner>,
}

impl std::fmt::Debug for ChainInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainInner").finish_non_exhaustive()
    }
}

impl Registration {
    /// Remove the interceptor. Returns `false` if it was already removed
    /// or its chain no longer exists.
    pub fn cancel(self) -> bool {
        let Some(inner) = self.chain.upgrade() else {
            return false;
        };
        let mut entries = inner
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = entries.len();
        entries.retain(|(id, _)| *id != self.id);
        entries.len() != before
    }
}
