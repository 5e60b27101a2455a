//! Metrics instrumentation for the sync service.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding binary is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `crm_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `method`: CRM API method name (crm.deal.list, batch, ...)
//! - `outcome` on `reconcile_total`: created, updated, updated_protected,
//!   attached, contact_created, queued, invalid
//! - `outcome` on `plan_syncs_total`: updated, cache_hit, throttled,
//!   oversized, source_error, api_error
//! - `status`: success, error

use metrics::{counter, gauge, histogram};
use std::time::Instant;

use crate::queue::QueueStatistics;

/// Record one CRM API call and its outcome.
pub fn record_api_call(method: &str, success: bool) {
    counter!(
        "crm_sync_api_calls_total",
        "method" => method.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record the reconciliation outcome for one record.
pub fn record_reconcile_outcome(outcome: &str) {
    counter!(
        "crm_sync_reconcile_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record one completed sync cycle.
pub fn record_cycle(duration_secs: f64, processed: usize, failed: usize) {
    counter!("crm_sync_cycles_total").increment(1);
    histogram!("crm_sync_cycle_seconds").record(duration_secs);
    counter!("crm_sync_records_processed_total").increment(processed as u64);
    counter!("crm_sync_records_failed_total").increment(failed as u64);
}

/// Publish the retry queue depth gauges.
pub fn set_queue_depth(stats: &QueueStatistics) {
    gauge!("crm_sync_queue_items", "status" => "pending").set(stats.pending as f64);
    gauge!("crm_sync_queue_items", "status" => "processing").set(stats.processing as f64);
    gauge!("crm_sync_queue_items", "status" => "completed").set(stats.completed as f64);
    gauge!("crm_sync_queue_items", "status" => "failed").set(stats.failed as f64);
    gauge!("crm_sync_queue_items", "status" => "permanently_failed")
        .set(stats.permanently_failed as f64);
}

/// Record the number of commands in one batch request.
pub fn record_batch_size(count: usize) {
    histogram!("crm_sync_batch_commands").record(count as f64);
}

/// Record a treatment-plan sync attempt.
pub fn record_plan_sync(outcome: &str) {
    counter!(
        "crm_sync_plan_syncs_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Measures one API call and records count plus latency on finish.
pub struct LatencyTimer {
    method: String,
    started: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn start(method: &str) -> Self {
        Self { method: method.to_string(), started: Instant::now() }
    }

    pub fn finish(self, success: bool) {
        record_api_call(&self.method, success);
        histogram!(
            "crm_sync_api_seconds",
            "method" => self.method
        )
        .record(self.started.elapsed().as_secs_f64());
    }
}
