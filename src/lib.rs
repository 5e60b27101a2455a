//! # CRM Sync
//!
//! A reconciliation engine that mirrors changes from a system of record
//! into a rate-limited CRM webhook API.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SyncOrchestrator                       │
//! │  • Polls the source feed on an interval                     │
//! │  • Persists a start-of-cycle watermark                      │
//! │  • Re-drives a bounded slice of the retry queue             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ReconciliationEngine                      │
//! │  • Bulk prefetch of deals/contacts per batch                │
//! │  • External-id resolution with suffix probing               │
//! │  • Contact identity by phone + name, family-aware           │
//! │  • Stage policy: final immutable, protected stage-frozen    │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼                                  ▼
//! ┌───────────────────────┐        ┌───────────────────────────┐
//! │      CrmClient        │        │       DurableQueue        │
//! │  • Dual rate limiter  │        │  • JSON file, atomic      │
//! │  • Bounded retries    │        │  • Exponential backoff    │
//! │  • 50-command batches │        │  • One entry per record   │
//! └───────────────────────┘        └───────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use crm_sync::{
//!     CrmClient, DurableQueue, ReconciliationEngine, SyncConfig, SyncOrchestrator,
//! };
//! use tokio::sync::watch;
//!
//! # use async_trait::async_trait;
//! # use chrono::{DateTime, Utc};
//! # struct MySource;
//! # #[async_trait]
//! # impl crm_sync::RecordSource for MySource {
//! #     async fn fetch_changed_records(
//! #         &self,
//! #         _since: DateTime<Utc>,
//! #         _limit: usize,
//! #     ) -> Result<Vec<crm_sync::SyncRecord>, crm_sync::SourceError> {
//! #         Ok(Vec::new())
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         webhook_url: "https://portal.example.com/rest/1/token".into(),
//!         ..Default::default()
//!     };
//!
//!     let client = Arc::new(CrmClient::new(&config).expect("bad webhook URL"));
//!     let queue = Arc::new(DurableQueue::open(
//!         &config.queue_path,
//!         config.queue_max_size,
//!         config.queue_retry_ceiling,
//!         config.queue_retry_base_minutes,
//!         config.queue_retention_days,
//!     ));
//!     let engine = Arc::new(ReconciliationEngine::new(
//!         client,
//!         queue.clone(),
//!         None,
//!         config.stages.clone(),
//!         config.id_probe_limit,
//!         config.prefetch_leads,
//!     ));
//!
//!     let source = Arc::new(MySource);
//!     let orchestrator = SyncOrchestrator::new(source, engine, queue, None, config);
//!
//!     let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//!     orchestrator.run(shutdown_rx).await;
//! }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod orchestrator;
pub mod persist;
pub mod plans;
pub mod queue;
pub mod record;
pub mod retry;
pub mod stage;

pub use client::{
    ApiError, CrmApi, CrmClient, DealUpdate, RateLimiter, RemoteContact, RemoteDeal, RemoteLead,
};
pub use config::SyncConfig;
pub use engine::{BatchOutcome, ReconciliationEngine, SyncError};
pub use orchestrator::{
    CycleError, CycleSummary, RecordSource, SourceError, SyncOrchestrator,
};
pub use plans::{PlanSource, PlanSourceError, PlanSyncManager, PlanSyncStatistics};
pub use queue::{DurableQueue, QueueItem, QueueItemStatus, QueueStatistics};
pub use record::{external_id, ContactFields, DealFields, SyncRecord, ValidationError};
pub use retry::{retry, retry_if, RetryConfig};
pub use stage::{StageClass, StagePolicy};
