//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - Recording handlers and observers
//! - Token store and event log wrappers that fail on demand
//! - Event and polling helpers

#![allow(dead_code)]

pub mod mocks;

pub use mocks::*;

use replay_engine::event::EventPayload;
use replay_engine::event_log::{EventLog, InMemoryEventLog};
use replay_engine::token::Token;
use serde_json::json;
use std::time::Duration;

/// How long `wait_for` polls before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A domain event payload keyed by `key`.
pub fn domain(key: &str) -> EventPayload {
    EventPayload::domain("TestEvent", key, json!({ "key": key }))
}

/// Append `count` domain events with keys `k0..k{count-1}`.
pub async fn seed(log: &InMemoryEventLog, count: usize) -> Token {
    let mut last = Token::TAIL;
    for i in 0..count {
        last = log.publish(domain(&format!("k{}", i))).await.unwrap();
    }
    last
}

/// Poll `condition` until it holds or [`WAIT_TIMEOUT`] elapses.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
