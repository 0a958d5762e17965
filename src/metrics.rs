// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tierdb.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tierdb_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: local, remote, db
//! - `operation`: by_id, by_ids, flush, exec, ...
//! - `outcome` / `status`: hit, miss, tombstone / success, error

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a cache lookup outcome (hit, miss, tombstone)
pub fn record_cache_lookup(tier: &str, table: &str, outcome: &str) {
    counter!(
        "tierdb_cache_lookups_total",
        "tier" => tier.to_string(),
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tierdb_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record mutations applied by a flush, per operation (insert, update, delete)
pub fn record_mutations(table: &str, operation: &str, count: usize) {
    counter!(
        "tierdb_mutations_total",
        "table" => table.to_string(),
        "operation" => operation.to_string()
    )
    .increment(count as u64);
}

/// Record a finished flush
pub fn record_flush(mode: &str, status: &str) {
    counter!(
        "tierdb_flushes_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record SQL statement latency per pool
pub fn record_sql(pool: &str, statement: &str, duration: Duration) {
    histogram!(
        "tierdb_sql_seconds",
        "pool" => pool.to_string(),
        "statement" => statement.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error by tier and kind
pub fn record_error(tier: &str, operation: &str, error_type: &str) {
    counter!(
        "tierdb_errors_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record connection error
pub fn record_connection_error(backend: &str) {
    counter!(
        "tierdb_connection_errors_total",
        "backend" => backend.to_string()
    )
    .increment(1);
}

/// Set current local cache entry count
pub fn set_local_cache_items(table: &str, count: usize) {
    gauge!(
        "tierdb_local_cache_items",
        "table" => table.to_string()
    )
    .set(count as f64);
}

/// Set async queue depth (in-process buffer or remote list)
pub fn set_async_queue_depth(queue: &str, stage: &str, depth: usize) {
    gauge!(
        "tierdb_async_queue_depth",
        "queue" => queue.to_string(),
        "stage" => stage.to_string()
    )
    .set(depth as f64);
}

/// Record async operations moved or applied
pub fn record_async_operations(queue: &str, stage: &str, count: usize) {
    counter!(
        "tierdb_async_operations_total",
        "queue" => queue.to_string(),
        "stage" => stage.to_string()
    )
    .increment(count as u64);
}

/// Record a distributed lock attempt (acquired, timeout, lost, released)
pub fn record_lock(outcome: &str) {
    counter!(
        "tierdb_lock_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record change events published
pub fn record_events(stream: &str, count: usize) {
    counter!(
        "tierdb_events_total",
        "stream" => stream.to_string()
    )
    .increment(count as u64);
}

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "tierdb_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records `tierdb_operation_seconds` when dropped.
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No recorder is installed, so these only check that nothing panics.

    #[test]
    fn test_counters() {
        record_cache_lookup("local", "users", "hit");
        record_cache_lookup("remote", "users", "tombstone");
        record_mutations("users", "insert", 3);
        record_flush("sync", "success");
        record_error("db", "flush", "duplicate");
        record_lock("acquired");
        record_events("log:users", 2);
    }

    #[test]
    fn test_gauges() {
        set_local_cache_items("users", 10);
        set_async_queue_depth("default", "buffer", 4);
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("flush", "sync");
            std::thread::sleep(Duration::from_micros(10));
        }
        record_sql("default", "insert", Duration::from_millis(2));
    }
}
