//! Treatment-plan synchronization.
//!
//! Plans live in the source system keyed by patient card number and are
//! mirrored into two custom deal fields: the rendered plan text and a
//! content hash. The hash cache makes the push idempotent (unchanged plans
//! are never re-sent) and a per-card throttle keeps a flapping source from
//! spamming the CRM.
//!
//! Plan sync failures are always swallowed here: a missing or broken plan
//! must never fail the reconciliation of the record that carried it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{CrmApi, DealUpdate};
use crate::metrics;
use crate::persist;

/// CRM custom-field size limit for the rendered plan text.
pub const MAX_PLAN_BYTES: usize = 60 * 1024;

#[derive(Debug, Error)]
pub enum PlanSourceError {
    #[error("plan source unavailable: {0}")]
    Unavailable(String),
    #[error("plan for card {0} unreadable: {1}")]
    Malformed(String, String),
}

/// Where rendered treatment plans come from. Implemented over the source
/// database in production and by fixtures in tests.
#[async_trait]
pub trait PlanSource: Send + Sync {
    /// Rendered plan text for a card, or `None` when the card has no plan.
    async fn fetch_plan(&self, card_number: &str) -> Result<Option<String>, PlanSourceError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PlanCache {
    /// card number -> content hash of the last pushed plan
    hashes: BTreeMap<String, String>,
    /// card number -> time of the last push
    timestamps: BTreeMap<String, DateTime<Utc>>,
    /// card number -> deal ids the current plan has been pushed to
    #[serde(rename = "dealMapping")]
    deal_mapping: BTreeMap<String, Vec<u64>>,
}

/// Counters exposed by [`PlanSyncManager::statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSyncStatistics {
    pub total_checks: u64,
    pub cache_hits: u64,
    pub throttled: u64,
    pub updated: u64,
    pub errors: u64,
    pub cached_cards: usize,
}

pub struct PlanSyncManager {
    api: Arc<dyn CrmApi>,
    source: Arc<dyn PlanSource>,
    cache_path: PathBuf,
    throttle: Duration,
    max_entries: usize,
    max_age: Duration,
    cache: Mutex<PlanCache>,

    total_checks: AtomicU64,
    cache_hits: AtomicU64,
    throttled: AtomicU64,
    updated: AtomicU64,
    errors: AtomicU64,
}

impl PlanSyncManager {
    pub fn new(
        api: Arc<dyn CrmApi>,
        source: Arc<dyn PlanSource>,
        cache_path: impl Into<PathBuf>,
        throttle_minutes: i64,
        max_entries: usize,
        max_age_days: i64,
    ) -> Self {
        let cache_path = cache_path.into();
        let cache = persist::load_json::<PlanCache>(&cache_path).unwrap_or_default();
        if !cache.hashes.is_empty() {
            info!(cards = cache.hashes.len(), path = %cache_path.display(),
                  "Loaded treatment plan cache");
        }

        Self {
            api,
            source,
            cache_path,
            throttle: Duration::minutes(throttle_minutes),
            max_entries: max_entries.max(10),
            max_age: Duration::days(max_age_days),
            cache: Mutex::new(cache),
            total_checks: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
            updated: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn save(&self, cache: &PlanCache) {
        if let Err(e) = persist::atomic_write_json(&self.cache_path, cache) {
            warn!(path = %self.cache_path.display(), error = %e,
                  "Failed to persist treatment plan cache");
        }
    }

    fn hash_plan(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Sync one deal's plan fields. Returns `true` when a push happened.
    /// Never propagates errors; plan sync is best-effort by contract.
    pub async fn sync_plan_for_deal(&self, card_number: &str, deal_id: u64) -> bool {
        self.total_checks.fetch_add(1, Ordering::Relaxed);

        let plan = match self.source.fetch_plan(card_number).await {
            Ok(Some(text)) => text,
            Ok(None) => return false,
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_plan_sync("source_error");
                warn!(card = card_number, error = %e, "Failed to fetch treatment plan");
                return false;
            }
        };

        // Oversized plans would be rejected or mangled by the CRM field;
        // skip the push entirely rather than store a partial document.
        if plan.len() > MAX_PLAN_BYTES {
            self.errors.fetch_add(1, Ordering::Relaxed);
            metrics::record_plan_sync("oversized");
            warn!(card = card_number, bytes = plan.len(), limit = MAX_PLAN_BYTES,
                  "Treatment plan exceeds field limit, skipping");
            return false;
        }

        let hash = Self::hash_plan(&plan);

        // Decide under the lock, push outside it.
        enum Verdict {
            Hit,
            Throttled,
            Push,
        }
        let verdict = {
            let cache = self.cache.lock();
            let hash_unchanged = cache.hashes.get(card_number) == Some(&hash);
            let deal_known = cache
                .deal_mapping
                .get(card_number)
                .is_some_and(|deals| deals.contains(&deal_id));

            if hash_unchanged && deal_known {
                Verdict::Hit
            } else if !hash_unchanged
                && cache
                    .timestamps
                    .get(card_number)
                    .is_some_and(|at| Utc::now() - *at < self.throttle)
            {
                Verdict::Throttled
            } else {
                Verdict::Push
            }
        };

        match verdict {
            Verdict::Hit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                metrics::record_plan_sync("cache_hit");
                false
            }
            Verdict::Throttled => {
                self.throttled.fetch_add(1, Ordering::Relaxed);
                metrics::record_plan_sync("throttled");
                debug!(card = card_number, "Plan changed but within throttle window, deferring");
                false
            }
            Verdict::Push => {
                let update = DealUpdate::plan_only(plan, hash.clone());
                match self.api.update_deal(deal_id, &update).await {
                    Ok(()) => {
                        self.record_push(card_number, deal_id, hash);
                        self.updated.fetch_add(1, Ordering::Relaxed);
                        metrics::record_plan_sync("updated");
                        debug!(card = card_number, deal_id, "Pushed treatment plan");
                        true
                    }
                    Err(e) => {
                        self.errors.fetch_add(1, Ordering::Relaxed);
                        metrics::record_plan_sync("api_error");
                        warn!(card = card_number, deal_id, error = %e,
                              "Failed to push treatment plan");
                        false
                    }
                }
            }
        }
    }

    fn record_push(&self, card_number: &str, deal_id: u64, hash: String) {
        let mut cache = self.cache.lock();

        // Hash change invalidates the pushed-deals set for the card
        if cache.hashes.get(card_number) != Some(&hash) {
            cache.deal_mapping.remove(card_number);
        }
        cache.hashes.insert(card_number.to_string(), hash);
        cache.timestamps.insert(card_number.to_string(), Utc::now());
        let deals = cache.deal_mapping.entry(card_number.to_string()).or_default();
        if !deals.contains(&deal_id) {
            deals.push(deal_id);
        }

        if cache.hashes.len() > self.max_entries {
            Self::evict_oldest(&mut cache, self.max_entries / 10);
        }
        self.save(&cache);
    }

    /// Evict the `count` least-recently-pushed cards.
    fn evict_oldest(cache: &mut PlanCache, count: usize) {
        let mut by_age: Vec<(DateTime<Utc>, String)> = cache
            .timestamps
            .iter()
            .map(|(card, at)| (*at, card.clone()))
            .collect();
        by_age.sort();

        for (_, card) in by_age.into_iter().take(count.max(1)) {
            cache.hashes.remove(&card);
            cache.timestamps.remove(&card);
            cache.deal_mapping.remove(&card);
        }
    }

    /// Sync plans for a batch of (card number, deal id) pairs, fetching each
    /// card's plan once. Returns the number of pushes performed.
    pub async fn sync_plans_batch(&self, pairs: &[(String, u64)]) -> usize {
        let mut by_card: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
        for (card, deal_id) in pairs {
            let deals = by_card.entry(card.as_str()).or_default();
            if !deals.contains(deal_id) {
                deals.push(*deal_id);
            }
        }

        let mut pushed = 0;
        for (card, deals) in by_card {
            for deal_id in deals {
                if self.sync_plan_for_deal(card, deal_id).await {
                    pushed += 1;
                }
            }
        }
        pushed
    }

    /// Drop cache entries whose last push is older than the retention age.
    pub fn cleanup_cache(&self) -> usize {
        let mut cache = self.cache.lock();
        let cutoff = Utc::now() - self.max_age;

        let expired: Vec<String> = cache
            .timestamps
            .iter()
            .filter(|(_, at)| **at < cutoff)
            .map(|(card, _)| card.clone())
            .collect();

        for card in &expired {
            cache.hashes.remove(card);
            cache.timestamps.remove(card);
            cache.deal_mapping.remove(card);
        }

        if !expired.is_empty() {
            info!(removed = expired.len(), "Expired stale treatment plan cache entries");
            self.save(&cache);
        }
        expired.len()
    }

    #[must_use]
    pub fn statistics(&self) -> PlanSyncStatistics {
        PlanSyncStatistics {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cached_cards: self.cache.lock().hashes.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    use crate::client::{ApiError, RemoteContact, RemoteDeal, RemoteLead};
    use crate::record::{ContactFields, DealFields};

    struct FixedPlans {
        plans: Mutex<HashMap<String, String>>,
        fetches: AtomicU64,
    }

    impl FixedPlans {
        fn new(plans: &[(&str, &str)]) -> Arc<Self> {
            Arc::new(Self {
                plans: Mutex::new(
                    plans.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
                ),
                fetches: AtomicU64::new(0),
            })
        }
    }

    #[async_trait]
    impl PlanSource for FixedPlans {
        async fn fetch_plan(&self, card_number: &str) -> Result<Option<String>, PlanSourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.plans.lock().get(card_number).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        updates: Mutex<Vec<(u64, DealUpdate)>>,
        fail_updates: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CrmApi for RecordingApi {
        async fn find_deal_by_external_id(
            &self,
            _: &str,
        ) -> Result<Option<RemoteDeal>, ApiError> {
            Ok(None)
        }
        async fn find_all_contacts_by_phone(
            &self,
            _: &str,
        ) -> Result<Vec<RemoteContact>, ApiError> {
            Ok(Vec::new())
        }
        async fn find_unlinked_open_deals(&self, _: u64) -> Result<Vec<RemoteDeal>, ApiError> {
            Ok(Vec::new())
        }
        async fn create_contact(&self, _: &ContactFields) -> Result<u64, ApiError> {
            Ok(1)
        }
        async fn create_deal(&self, _: &DealFields, _: &str, _: u64) -> Result<u64, ApiError> {
            Ok(1)
        }
        async fn update_deal(&self, deal_id: u64, update: &DealUpdate) -> Result<(), ApiError> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(ApiError::Server { status: 500 });
            }
            self.updates.lock().push((deal_id, update.clone()));
            Ok(())
        }
        async fn batch_find_contacts_by_phones(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Vec<RemoteContact>>, ApiError> {
            Ok(HashMap::new())
        }
        async fn batch_find_deals_by_external_ids(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Option<RemoteDeal>>, ApiError> {
            Ok(HashMap::new())
        }
        async fn batch_find_leads_by_phones(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Vec<RemoteLead>>, ApiError> {
            Ok(HashMap::new())
        }
        async fn test_connection(&self) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn manager(
        dir: &std::path::Path,
        api: Arc<RecordingApi>,
        source: Arc<FixedPlans>,
    ) -> PlanSyncManager {
        PlanSyncManager::new(api, source, dir.join("plans.json"), 30, 100, 90)
    }

    #[tokio::test]
    async fn test_first_push_then_cache_hit() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[("K-1", "plan v1")]);
        let m = manager(dir.path(), api.clone(), source);

        assert!(m.sync_plan_for_deal("K-1", 97).await);
        assert!(!m.sync_plan_for_deal("K-1", 97).await);

        let stats = m.statistics();
        assert_eq!(stats.updated, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(api.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_same_plan_pushes_to_new_deal() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[("K-1", "plan v1")]);
        let m = manager(dir.path(), api.clone(), source);

        assert!(m.sync_plan_for_deal("K-1", 97).await);
        // Unchanged hash, but a deal that never saw the plan
        assert!(m.sync_plan_for_deal("K-1", 98).await);
        assert_eq!(api.updates.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_changed_plan_throttled_within_window() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[("K-1", "plan v1")]);
        let m = manager(dir.path(), api.clone(), source.clone());

        assert!(m.sync_plan_for_deal("K-1", 97).await);
        source.plans.lock().insert("K-1".into(), "plan v2".into());

        // Changed hash inside the 30-minute window is deferred
        assert!(!m.sync_plan_for_deal("K-1", 97).await);
        assert_eq!(m.statistics().throttled, 1);
        assert_eq!(api.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_plan_is_noop() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[]);
        let m = manager(dir.path(), api.clone(), source);

        assert!(!m.sync_plan_for_deal("K-404", 97).await);
        assert!(api.updates.lock().is_empty());
        assert_eq!(m.statistics().errors, 0);
    }

    #[tokio::test]
    async fn test_api_failure_is_swallowed_and_counted() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        api.fail_updates.store(true, Ordering::SeqCst);
        let source = FixedPlans::new(&[("K-1", "plan v1")]);
        let m = manager(dir.path(), api.clone(), source);

        assert!(!m.sync_plan_for_deal("K-1", 97).await);
        assert_eq!(m.statistics().errors, 1);

        // Failed push leaves no cache entry, so the next attempt retries
        api.fail_updates.store(false, Ordering::SeqCst);
        assert!(m.sync_plan_for_deal("K-1", 97).await);
    }

    #[tokio::test]
    async fn test_oversized_plan_rejected() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let big = "x".repeat(MAX_PLAN_BYTES + 100);
        let source = FixedPlans::new(&[("K-1", big.as_str())]);
        let m = manager(dir.path(), api.clone(), source);

        assert!(!m.sync_plan_for_deal("K-1", 97).await);
        assert!(api.updates.lock().is_empty());
        assert_eq!(m.statistics().errors, 1);
        assert_eq!(m.statistics().cached_cards, 0);
    }

    #[tokio::test]
    async fn test_batch_fetches_once_per_card() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[("K-1", "plan v1"), ("K-2", "plan v2")]);
        let m = manager(dir.path(), api.clone(), source.clone());

        let pairs = vec![
            ("K-1".to_string(), 97),
            ("K-1".to_string(), 97), // duplicate collapses
            ("K-2".to_string(), 98),
        ];
        assert_eq!(m.sync_plans_batch(&pairs).await, 2);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cache_persists_across_restart() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let source = FixedPlans::new(&[("K-1", "plan v1")]);

        {
            let m = manager(dir.path(), api.clone(), source.clone());
            assert!(m.sync_plan_for_deal("K-1", 97).await);
        }

        let m = manager(dir.path(), api.clone(), source);
        assert!(!m.sync_plan_for_deal("K-1", 97).await);
        assert_eq!(m.statistics().cache_hits, 1);
        assert_eq!(api.updates.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_eviction_caps_cache_size() {
        let dir = tempdir().unwrap();
        let api = Arc::new(RecordingApi::default());
        let plans: Vec<(String, String)> =
            (0..15).map(|i| (format!("K-{i}"), format!("plan {i}"))).collect();
        let refs: Vec<(&str, &str)> =
            plans.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let source = FixedPlans::new(&refs);
        let m = PlanSyncManager::new(api, source, dir.path().join("plans.json"), 30, 10, 90);

        for i in 0..15 {
            m.sync_plan_for_deal(&format!("K-{i}"), 100 + i).await;
        }
        assert!(m.statistics().cached_cards <= 11);
    }
}
