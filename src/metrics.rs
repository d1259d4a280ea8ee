//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Processor mode transitions
//! - Replay sessions (started, completed, active)
//! - Segment positions and replay progress
//! - Event processing outcomes
//! - Token store retries
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use replay_engine::metrics;
//! use std::time::Duration;
//!
//! // In a pull worker after a batch
//! metrics::record_batch_processed("orders", 0, 42, Duration::from_millis(8));
//!
//! // In the coordinator after finalize
//! metrics::record_session_completed(2, Duration::from_secs(30));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a successful processor mode transition.
pub fn record_mode_transition(group: &str, to_mode: &str) {
    counter!(
        "replay_mode_transitions_total",
        "group" => group.to_string(),
        "to" => to_mode.to_string()
    )
    .increment(1);
}

/// Record a mode switch that lost the compare-and-swap (idempotent no-op).
pub fn record_mode_transition_noop(group: &str, requested: &str) {
    counter!(
        "replay_mode_transition_noops_total",
        "group" => group.to_string(),
        "requested" => requested.to_string()
    )
    .increment(1);
}

/// Gauge for a group's current mode (0=push, 1=pull).
pub fn set_processor_mode(group: &str, mode: &str) {
    let value = match mode {
        "push" => 0.0,
        "pull" => 1.0,
        _ => -1.0,
    };
    gauge!("replay_processor_mode", "group" => group.to_string()).set(value);
}

/// Record a reset protocol run.
pub fn record_reset(group: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("replay_resets_total", "group" => group.to_string(), "status" => status).increment(1);
    histogram!("replay_reset_duration_seconds", "group" => group.to_string()).record(duration.as_secs_f64());
}

/// Record a replay session start.
pub fn record_session_started(target_count: usize) {
    counter!("replay_sessions_started_total").increment(1);
    gauge!("replay_session_active").set(1.0);
    gauge!("replay_session_targets").set(target_count as f64);
}

/// Record a rejected replay request by reason.
pub fn record_session_rejected(reason: &str) {
    counter!("replay_sessions_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Record a finalized replay session.
pub fn record_session_completed(target_count: usize, duration: Duration) {
    counter!("replay_sessions_completed_total").increment(1);
    histogram!("replay_session_duration_seconds").record(duration.as_secs_f64());
    histogram!("replay_session_targets_completed").record(target_count as f64);
    clear_session_active();
}

/// Mark that no session is active.
pub fn clear_session_active() {
    gauge!("replay_session_active").set(0.0);
    gauge!("replay_session_targets").set(0.0);
}

/// Record a replay marker ingestion outcome.
pub fn record_marker_outcome(outcome: &str) {
    counter!("replay_marker_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a completion check that found targets still replaying.
pub fn record_completion_check(still_replaying: usize) {
    counter!("replay_completion_checks_total").increment(1);
    gauge!("replay_completion_pending_groups").set(still_replaying as f64);
}

/// Record a completion observer failure.
pub fn record_observer_failure(observer: &str) {
    counter!("replay_observer_failures_total", "observer" => observer.to_string()).increment(1);
}

/// Record a segment's position and remaining replay distance.
pub fn record_segment_position(group: &str, segment: u32, position: u64, replay_remaining: u64) {
    let segment = segment.to_string();
    gauge!("replay_segment_position", "group" => group.to_string(), "segment" => segment.clone())
        .set(position as f64);
    gauge!("replay_segment_remaining", "group" => group.to_string(), "segment" => segment)
        .set(replay_remaining as f64);
}

/// Record a processed pull batch.
pub fn record_batch_processed(group: &str, segment: u32, events: usize, duration: Duration) {
    let segment = segment.to_string();
    counter!("replay_pull_batches_total", "group" => group.to_string(), "segment" => segment.clone())
        .increment(1);
    counter!("replay_pull_events_read_total", "group" => group.to_string(), "segment" => segment)
        .increment(events as u64);
    histogram!("replay_pull_batch_duration_seconds", "group" => group.to_string())
        .record(duration.as_secs_f64());
}

/// Record an event dispatch outcome.
pub fn record_event_processed(group: &str, mode: &str, outcome: &str) {
    counter!(
        "replay_events_processed_total",
        "group" => group.to_string(),
        "mode" => mode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a push subscriber that fell behind the live broadcast.
pub fn record_push_lagged(group: &str, skipped: u64) {
    counter!("replay_push_lagged_events_total", "group" => group.to_string()).increment(skipped);
}

/// Record events delivered while handing a group back from pull to push.
pub fn record_handover_catch_up(group: &str, events: usize) {
    counter!("replay_handover_catch_up_events_total", "group" => group.to_string()).increment(events as u64);
}

/// Record token persistence.
pub fn record_token_persist(group: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replay_token_persists_total", "group" => group.to_string(), "status" => status).increment(1);
}

/// Record token store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn token_store_retries_total(operation: &str) {
    counter!("replay_token_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record errors by type.
pub fn record_error(group: &str, error_type: &str) {
    counter!(
        "replay_errors_total",
        "group" => group.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Starting" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replay_engine_state").set(value);
}
