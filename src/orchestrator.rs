//! Top-level sync loop.
//!
//! The orchestrator owns the polling cadence: every cycle it pulls changed
//! records from the source feed since the persisted watermark, pushes them
//! through the reconciliation engine in API-sized chunks, re-drives a
//! bounded slice of the retry queue, and only then advances the watermark.
//!
//! The watermark is the cycle's *start* time: records that change while a
//! cycle runs are fetched again next cycle rather than silently missed.
//! Reconciliation is idempotent, so the overlap is harmless.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::client::ApiError;
use crate::config::SyncConfig;
use crate::engine::{ReconciliationEngine, SyncError};
use crate::metrics;
use crate::persist;
use crate::plans::PlanSyncManager;
use crate::queue::DurableQueue;
use crate::record::SyncRecord;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),
    #[error("source query failed: {0}")]
    Query(String),
}

/// The change feed of the system of record.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Records changed since `since`, newest first, at most `limit`.
    /// Re-fetching the same window must be idempotent.
    async fn fetch_changed_records(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SyncRecord>, SourceError>;
}

/// A cycle failure. The watermark is never advanced past a failed cycle.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// What one cycle accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleSummary {
    pub fetched: usize,
    pub succeeded: usize,
    pub queued: usize,
    pub dropped_invalid: usize,
    pub drained: usize,
    pub drain_failed: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkFile {
    last_sync_time: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct SyncOrchestrator {
    source: Arc<dyn RecordSource>,
    engine: Arc<ReconciliationEngine>,
    queue: Arc<DurableQueue>,
    plans: Option<Arc<PlanSyncManager>>,
    config: SyncConfig,
    watermark_path: PathBuf,
    watermark: Mutex<Option<DateTime<Utc>>>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn RecordSource>,
        engine: Arc<ReconciliationEngine>,
        queue: Arc<DurableQueue>,
        plans: Option<Arc<PlanSyncManager>>,
        config: SyncConfig,
    ) -> Self {
        let watermark_path = PathBuf::from(&config.watermark_path);
        let watermark = persist::load_json::<WatermarkFile>(&watermark_path)
            .map(|w| w.last_sync_time);
        if let Some(at) = watermark {
            info!(last_sync = %at, "Resuming from persisted watermark");
        }

        Self {
            source,
            engine,
            queue,
            plans,
            config,
            watermark_path,
            watermark: Mutex::new(watermark),
        }
    }

    /// Run cycles until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = StdDuration::from_secs(self.config.sync_interval_minutes * 60);
        info!(
            interval_minutes = self.config.sync_interval_minutes,
            "Sync loop starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_cycle().await {
                Ok(summary) => debug!(?summary, "Cycle finished"),
                Err(e) => error!(error = %e, "Cycle failed, will retry next interval"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Sync loop stopped");
    }

    /// One full cycle: fetch, reconcile, drain the queue, housekeeping.
    pub async fn run_cycle(&self) -> Result<CycleSummary, CycleError> {
        let cycle_start = Utc::now();
        let started = std::time::Instant::now();

        let since = self
            .watermark
            .lock()
            .unwrap_or_else(|| cycle_start - Duration::days(self.config.initial_days));

        let records = self
            .source
            .fetch_changed_records(since, self.config.record_batch_size)
            .await?;

        let mut summary = CycleSummary { fetched: records.len(), ..Default::default() };
        for chunk in records.chunks(self.config.api_batch_size.max(1)) {
            let outcome = self.engine.process_batch(chunk).await?;
            summary.succeeded += outcome.succeeded;
            summary.queued += outcome.queued;
            summary.dropped_invalid += outcome.dropped_invalid;
        }

        self.drain_queue(&mut summary).await?;

        self.queue.cleanup();
        if let Some(plans) = &self.plans {
            plans.cleanup_cache();
            let stats = plans.statistics();
            debug!(
                checks = stats.total_checks,
                updated = stats.updated,
                cache_hits = stats.cache_hits,
                throttled = stats.throttled,
                errors = stats.errors,
                "Treatment plan sync statistics"
            );
        }

        self.advance_watermark(cycle_start);

        let stats = self.queue.statistics();
        metrics::set_queue_depth(&stats);
        metrics::record_cycle(
            started.elapsed().as_secs_f64(),
            summary.succeeded,
            summary.queued + summary.drain_failed,
        );
        info!(
            fetched = summary.fetched,
            succeeded = summary.succeeded,
            queued = summary.queued,
            dropped_invalid = summary.dropped_invalid,
            drained = summary.drained,
            drain_failed = summary.drain_failed,
            queue_depth = stats.total - stats.completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Sync cycle complete"
        );

        Ok(summary)
    }

    /// Re-drive a bounded slice of the retry queue. Validation failures on
    /// old queue entries are poison and are completed away with a warning;
    /// a fatal API error stops the drain and fails the cycle.
    async fn drain_queue(&self, summary: &mut CycleSummary) -> Result<(), CycleError> {
        for _ in 0..self.config.queue_drain_per_cycle {
            let Some(item) = self.queue.claim() else { break };

            match self.engine.reconcile_one(&item.record).await {
                Ok(deal_id) => {
                    self.queue.complete(&item.key);
                    summary.drained += 1;
                    debug!(key = %item.key, deal_id, retries = item.retry_count,
                           "Re-drove queued record");
                }
                Err(SyncError::Validation(e)) => {
                    warn!(key = %item.key, error = %e,
                          "Queued record no longer valid, discarding");
                    self.queue.complete(&item.key);
                }
                Err(SyncError::Api(e)) if e.is_fatal() => {
                    self.queue.fail(&item.key, &e.to_string());
                    return Err(e.into());
                }
                Err(e) => {
                    self.queue.fail(&item.key, &e.to_string());
                    summary.drain_failed += 1;
                }
            }
        }
        Ok(())
    }

    fn advance_watermark(&self, to: DateTime<Utc>) {
        *self.watermark.lock() = Some(to);
        let file = WatermarkFile { last_sync_time: to, updated_at: Utc::now() };
        if let Err(e) = persist::atomic_write_json(&self.watermark_path, &file) {
            warn!(path = %self.watermark_path.display(), error = %e,
                  "Failed to persist sync watermark");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    use crate::client::{
        CrmApi, DealUpdate, RemoteContact, RemoteDeal, RemoteLead,
    };
    use crate::record::{ContactFields, DealFields};
    use crate::stage::StagePolicy;

    /// Happy-path in-memory CRM: every id resolves, creates always work.
    #[derive(Default)]
    struct StubCrm {
        created_deals: Mutex<Vec<String>>,
        next_id: AtomicU64,
        fail: std::sync::atomic::AtomicBool,
    }

    impl StubCrm {
        fn check(&self) -> Result<(), ApiError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(ApiError::Server { status: 503 })
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CrmApi for StubCrm {
        async fn find_deal_by_external_id(
            &self,
            _: &str,
        ) -> Result<Option<RemoteDeal>, ApiError> {
            self.check()?;
            Ok(None)
        }
        async fn find_all_contacts_by_phone(
            &self,
            _: &str,
        ) -> Result<Vec<RemoteContact>, ApiError> {
            self.check()?;
            Ok(Vec::new())
        }
        async fn find_unlinked_open_deals(&self, _: u64) -> Result<Vec<RemoteDeal>, ApiError> {
            self.check()?;
            Ok(Vec::new())
        }
        async fn create_contact(&self, _: &ContactFields) -> Result<u64, ApiError> {
            self.check()?;
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
        async fn create_deal(&self, _: &DealFields, id: &str, _: u64) -> Result<u64, ApiError> {
            self.check()?;
            self.created_deals.lock().push(id.to_string());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
        }
        async fn update_deal(&self, _: u64, _: &DealUpdate) -> Result<(), ApiError> {
            self.check()
        }
        async fn batch_find_contacts_by_phones(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Vec<RemoteContact>>, ApiError> {
            self.check()?;
            Ok(HashMap::new())
        }
        async fn batch_find_deals_by_external_ids(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Option<RemoteDeal>>, ApiError> {
            self.check()?;
            Ok(HashMap::new())
        }
        async fn batch_find_leads_by_phones(
            &self,
            _: &[String],
        ) -> Result<HashMap<String, Vec<RemoteLead>>, ApiError> {
            self.check()?;
            Ok(HashMap::new())
        }
        async fn test_connection(&self) -> Result<(), ApiError> {
            self.check()
        }
    }

    #[derive(Default)]
    struct StubSource {
        records: Mutex<Vec<SyncRecord>>,
        last_since: Mutex<Option<DateTime<Utc>>>,
    }

    #[async_trait]
    impl RecordSource for StubSource {
        async fn fetch_changed_records(
            &self,
            since: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<SyncRecord>, SourceError> {
            *self.last_since.lock() = Some(since);
            let records = self.records.lock();
            Ok(records.iter().take(limit).cloned().collect())
        }
    }

    fn record(external_id: &str) -> SyncRecord {
        SyncRecord {
            external_id: external_id.into(),
            contact: ContactFields {
                phone: "+79990000000".into(),
                given_name: "Ivan".into(),
                family_name: "Petrov".into(),
                middle_name: None,
                extra: BTreeMap::new(),
            },
            deal: DealFields {
                title: "Visit".into(),
                stage_id: "NEW".into(),
                opportunity: 100.0,
                currency: "RUB".into(),
                comment: None,
                card_number: None,
                custom: BTreeMap::new(),
            },
        }
    }

    struct Fixture {
        orchestrator: SyncOrchestrator,
        source: Arc<StubSource>,
        crm: Arc<StubCrm>,
        queue: Arc<DurableQueue>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        fixture_in(dir)
    }

    fn fixture_in(dir: tempfile::TempDir) -> Fixture {
        let config = SyncConfig {
            watermark_path: dir.path().join("state.json").display().to_string(),
            queue_path: dir.path().join("q.json").display().to_string(),
            queue_drain_per_cycle: 10,
            ..SyncConfig::default()
        };

        let crm = Arc::new(StubCrm::default());
        let source = Arc::new(StubSource::default());
        let queue = Arc::new(DurableQueue::open(&config.queue_path, 100, 3, 5, 7));
        let engine = Arc::new(ReconciliationEngine::new(
            crm.clone(),
            queue.clone(),
            None,
            StagePolicy::default(),
            10,
            false,
        ));
        let orchestrator = SyncOrchestrator::new(
            source.clone(),
            engine,
            queue.clone(),
            None,
            config,
        );

        Fixture { orchestrator, source, crm, queue, _dir: dir }
    }

    #[tokio::test]
    async fn test_first_cycle_uses_initial_lookback() {
        let f = fixture();
        f.orchestrator.run_cycle().await.unwrap();

        let since = f.source.last_since.lock().unwrap();
        let expected = Utc::now() - Duration::days(30);
        assert!((since - expected).num_minutes().abs() < 2);
    }

    #[tokio::test]
    async fn test_watermark_advances_and_persists() {
        let dir = tempdir().unwrap();
        let first_start = Utc::now();
        let f = fixture_in(dir);
        f.orchestrator.run_cycle().await.unwrap();
        f.orchestrator.run_cycle().await.unwrap();

        // Second cycle fetched from roughly the first cycle's start
        let since = f.source.last_since.lock().unwrap();
        assert!(since >= first_start - Duration::seconds(1));

        // And the watermark survives a restart
        let path = f.orchestrator.watermark_path.clone();
        let file: WatermarkFile = persist::load_json(&path).unwrap();
        assert!(file.last_sync_time >= first_start - Duration::seconds(1));
    }

    #[tokio::test]
    async fn test_cycle_reconciles_fetched_records() {
        let f = fixture();
        f.source.records.lock().extend([record("F1_1"), record("F1_2")]);

        let summary = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(f.crm.created_deals.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_watermark() {
        let f = fixture();
        f.orchestrator.run_cycle().await.unwrap();
        let watermark_before = *f.orchestrator.watermark.lock();

        // A failing CRM fails the cycle once there is work to do
        f.source.records.lock().push(record("F1_1"));
        f.crm.fail.store(true, Ordering::SeqCst);
        let summary = f.orchestrator.run_cycle().await.unwrap();
        // Transient failures queue the record rather than fail the cycle
        assert_eq!(summary.queued, 1);

        // A broken source feed does fail the cycle and freezes the watermark
        struct BrokenSource;
        #[async_trait]
        impl RecordSource for BrokenSource {
            async fn fetch_changed_records(
                &self,
                _: DateTime<Utc>,
                _: usize,
            ) -> Result<Vec<SyncRecord>, SourceError> {
                Err(SourceError::Unavailable("db down".into()))
            }
        }

        let mut broken = f.orchestrator;
        broken.source = Arc::new(BrokenSource);
        *broken.watermark.lock() = watermark_before;
        assert!(broken.run_cycle().await.is_err());
        assert_eq!(*broken.watermark.lock(), watermark_before);
    }

    #[tokio::test]
    async fn test_drain_redrives_queue() {
        let f = fixture();
        f.queue.add(&record("F1_9"), "old failure");

        let summary = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.drained, 1);
        assert!(!f.queue.exists("F1_9"));
        assert!(f.crm.created_deals.lock().contains(&"F1_9".to_string()));
    }

    #[tokio::test]
    async fn test_drain_failure_backs_off_item() {
        let f = fixture();
        f.queue.add(&record("F1_9"), "old failure");
        f.crm.fail.store(true, Ordering::SeqCst);

        let summary = f.orchestrator.run_cycle().await.unwrap();
        assert_eq!(summary.drain_failed, 1);
        // Still live, but deferred
        assert!(f.queue.exists("F1_9"));
        assert_eq!(f.queue.statistics().failed, 1);
    }

    #[tokio::test]
    async fn test_drain_discards_poison_items() {
        let f = fixture();
        let mut bad = record("F1_9");
        bad.deal.title = String::new();
        f.queue.add(&bad, "old failure");

        f.orchestrator.run_cycle().await.unwrap();
        assert!(!f.queue.exists("F1_9"));
        assert!(f.crm.created_deals.lock().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(true);
        // Already shut down: run returns without a cycle
        f.orchestrator.run(rx).await;
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_executes_cycles_until_shutdown() {
        let f = fixture();
        f.source.records.lock().push(record("F1_1"));
        let (tx, rx) = watch::channel(false);

        let orchestrator = Arc::new(f.orchestrator);
        let handle = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.run(rx).await })
        };

        // Give the first cycle a chance to run, then stop
        tokio::time::sleep(StdDuration::from_secs(1)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(!f.crm.created_deals.lock().is_empty());
    }
}
