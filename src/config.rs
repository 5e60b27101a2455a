//! Configuration for the sync service.
//!
//! # Example
//!
//! ```
//! use crm_sync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.rate_per_minute, 120);
//!
//! // Full config
//! let config = SyncConfig {
//!     webhook_url: "https://portal.example.com/rest/1/token".into(),
//!     branch_id: 3,
//!     sync_interval_minutes: 5,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

use crate::stage::StagePolicy;

/// Configuration for the sync service.
///
/// All fields have sensible defaults except `webhook_url`, which must be
/// set for production use.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Incoming webhook base URL (e.g. "https://portal.example.com/rest/1/token")
    #[serde(default)]
    pub webhook_url: String,

    /// Branch/tenant id baked into every external id
    #[serde(default = "default_branch_id")]
    pub branch_id: u32,

    /// Minutes between polling cycles
    #[serde(default = "default_sync_interval_minutes")]
    pub sync_interval_minutes: u64,

    /// Look-back window in days for the very first run (no watermark yet)
    #[serde(default = "default_initial_days")]
    pub initial_days: i64,

    /// Max records fetched from the source feed per cycle
    #[serde(default = "default_record_batch_size")]
    pub record_batch_size: usize,

    /// Records reconciled per bulk pre-lookup batch
    #[serde(default = "default_api_batch_size")]
    pub api_batch_size: usize,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Attempt ceiling for transient API failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// Responsible user stamped on created contacts and deals (optional)
    #[serde(default)]
    pub default_assigned_by_id: Option<u64>,

    /// Rate limit: requests per second
    #[serde(default = "default_rate_per_second")]
    pub rate_per_second: f64,

    /// Rate limit: requests per sliding minute
    #[serde(default = "default_rate_per_minute")]
    pub rate_per_minute: usize,

    /// Retry queue file
    #[serde(default = "default_queue_path")]
    pub queue_path: String,
    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_queue_retry_ceiling")]
    pub queue_retry_ceiling: u32,
    #[serde(default = "default_queue_retry_base_minutes")]
    pub queue_retry_base_minutes: i64,
    #[serde(default = "default_queue_retention_days")]
    pub queue_retention_days: i64,
    /// Max queue items re-driven per cycle
    #[serde(default = "default_queue_drain_per_cycle")]
    pub queue_drain_per_cycle: usize,

    /// Treatment-plan cache file
    #[serde(default = "default_plan_cache_path")]
    pub plan_cache_path: String,
    /// Minimum minutes between plan pushes for the same card
    #[serde(default = "default_plan_throttle_minutes")]
    pub plan_throttle_minutes: i64,
    #[serde(default = "default_plan_cache_max_entries")]
    pub plan_cache_max_entries: usize,
    #[serde(default = "default_plan_cache_max_age_days")]
    pub plan_cache_max_age_days: i64,

    /// Last-successful-sync watermark file
    #[serde(default = "default_watermark_path")]
    pub watermark_path: String,

    /// Suffix probe budget for external-id collision avoidance
    #[serde(default = "default_id_probe_limit")]
    pub id_probe_limit: u32,

    /// Also bulk-prefetch leads per cycle (observability only)
    #[serde(default)]
    pub prefetch_leads: bool,

    /// Stage classification lists
    #[serde(default)]
    pub stages: StagePolicy,
}

fn default_branch_id() -> u32 { 1 }
fn default_sync_interval_minutes() -> u64 { 2 }
fn default_initial_days() -> i64 { 30 }
fn default_record_batch_size() -> usize { 100 }
fn default_api_batch_size() -> usize { 20 }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_max_attempts() -> usize { 3 }
fn default_rate_per_second() -> f64 { 2.0 }
fn default_rate_per_minute() -> usize { 120 }
fn default_queue_path() -> String { "queue.json".into() }
fn default_queue_max_size() -> usize { 1000 }
fn default_queue_retry_ceiling() -> u32 { 3 }
fn default_queue_retry_base_minutes() -> i64 { 5 }
fn default_queue_retention_days() -> i64 { 7 }
fn default_queue_drain_per_cycle() -> usize { 10 }
fn default_plan_cache_path() -> String { "treatment_plan_cache.json".into() }
fn default_plan_throttle_minutes() -> i64 { 30 }
fn default_plan_cache_max_entries() -> usize { 10_000 }
fn default_plan_cache_max_age_days() -> i64 { 90 }
fn default_watermark_path() -> String { "sync_state.json".into() }
fn default_id_probe_limit() -> u32 { 10 }

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            branch_id: default_branch_id(),
            sync_interval_minutes: default_sync_interval_minutes(),
            initial_days: default_initial_days(),
            record_batch_size: default_record_batch_size(),
            api_batch_size: default_api_batch_size(),
            request_timeout_secs: default_request_timeout_secs(),
            max_attempts: default_max_attempts(),
            default_assigned_by_id: None,
            rate_per_second: default_rate_per_second(),
            rate_per_minute: default_rate_per_minute(),
            queue_path: default_queue_path(),
            queue_max_size: default_queue_max_size(),
            queue_retry_ceiling: default_queue_retry_ceiling(),
            queue_retry_base_minutes: default_queue_retry_base_minutes(),
            queue_retention_days: default_queue_retention_days(),
            queue_drain_per_cycle: default_queue_drain_per_cycle(),
            plan_cache_path: default_plan_cache_path(),
            plan_throttle_minutes: default_plan_throttle_minutes(),
            plan_cache_max_entries: default_plan_cache_max_entries(),
            plan_cache_max_age_days: default_plan_cache_max_age_days(),
            watermark_path: default_watermark_path(),
            id_probe_limit: default_id_probe_limit(),
            prefetch_leads: false,
            stages: StagePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.sync_interval_minutes, 2);
        assert_eq!(config.record_batch_size, 100);
        assert_eq!(config.api_batch_size, 20);
        assert_eq!(config.queue_retry_ceiling, 3);
        assert_eq!(config.queue_retry_base_minutes, 5);
        assert_eq!(config.rate_per_second, 2.0);
        assert_eq!(config.rate_per_minute, 120);
        assert_eq!(config.id_probe_limit, 10);
        assert!(!config.prefetch_leads);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: SyncConfig = serde_json::from_str(
            r#"{
                "webhook_url": "https://portal.example.com/rest/1/abc",
                "branch_id": 4,
                "rate_per_minute": 60
            }"#,
        )
        .unwrap();

        assert_eq!(config.branch_id, 4);
        assert_eq!(config.rate_per_minute, 60);
        // Untouched fields fall back to defaults
        assert_eq!(config.queue_max_size, 1000);
        assert_eq!(config.plan_throttle_minutes, 30);
    }

    #[test]
    fn test_deserialize_nested_stage_policy() {
        let config: SyncConfig = serde_json::from_str(
            r#"{"stages": {"final_stages": ["CLOSED_WON", "CLOSED_LOST"]}}"#,
        )
        .unwrap();

        assert!(config.stages.is_final("CLOSED_WON"));
        assert!(!config.stages.is_final("WON"));
    }
}
