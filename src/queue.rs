//! Durable retry queue.
//!
//! Records whose reconciliation failed on a non-fatal API error are parked
//! here and re-driven on later cycles with exponential backoff. The queue
//! is a single JSON file rewritten atomically on every mutation, so a
//! crash never loses accepted work and never replays completed work.
//!
//! Keys are external ids: at most one in-flight entry may exist per
//! logical record, which keeps redrive idempotent.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::persist;
use crate::record::SyncRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemStatus {
    /// Waiting for its next attempt.
    Pending,
    /// Claimed by the current drain pass.
    Processing,
    /// Succeeded on redrive; kept briefly for observability.
    Completed,
    /// Exhausted its retry budget; requires operator intervention.
    PermanentlyFailed,
}

/// One parked record plus its retry bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub key: String,
    pub record: SyncRecord,
    pub status: QueueItemStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Point-in-time queue depth breakdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub permanently_failed: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueFile {
    items: BTreeMap<String, QueueItem>,
}

/// File-backed retry queue. All operations are synchronous and take the
/// internal lock briefly; persistence happens inside the lock so the file
/// always reflects the last returned state.
pub struct DurableQueue {
    path: PathBuf,
    max_size: usize,
    retry_ceiling: u32,
    retry_base_minutes: i64,
    retention_days: i64,
    items: Mutex<BTreeMap<String, QueueItem>>,
}

impl DurableQueue {
    /// Load the queue from `path`, or start empty when the file is missing
    /// or unreadable. Items left in `processing` by a crash are reset to
    /// `pending` so they become eligible again.
    pub fn open(
        path: impl Into<PathBuf>,
        max_size: usize,
        retry_ceiling: u32,
        retry_base_minutes: i64,
        retention_days: i64,
    ) -> Self {
        let path = path.into();
        let mut items = persist::load_json::<QueueFile>(&path).unwrap_or_default().items;

        let mut recovered = 0;
        for item in items.values_mut() {
            if item.status == QueueItemStatus::Processing {
                item.status = QueueItemStatus::Pending;
                item.updated_at = Utc::now();
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered in-flight queue items from previous run");
        }
        if !items.is_empty() {
            info!(items = items.len(), path = %path.display(), "Loaded retry queue");
        }

        Self {
            path,
            max_size,
            retry_ceiling: retry_ceiling.max(1),
            retry_base_minutes,
            retention_days,
            items: Mutex::new(items),
        }
    }

    fn save(&self, items: &BTreeMap<String, QueueItem>) {
        let file = QueueFile { items: items.clone() };
        if let Err(e) = persist::atomic_write_json(&self.path, &file) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist retry queue");
        }
    }

    /// Park a failed record. Returns `false` when an entry for the same
    /// external id is already in flight, or the queue is full. A completed
    /// or permanently failed leftover under the key is replaced by a fresh
    /// pending item: the feed re-surfacing the record re-arms it.
    pub fn add(&self, record: &SyncRecord, error: &str) -> bool {
        let mut items = self.items.lock();
        let key = record.external_id.clone();

        if let Some(existing) = items.get(&key) {
            match existing.status {
                QueueItemStatus::Pending | QueueItemStatus::Processing => {
                    debug!(key = %key, "Record already queued, not duplicating");
                    return false;
                }
                QueueItemStatus::PermanentlyFailed => {
                    info!(key = %key, retries = existing.retry_count,
                          "Re-arming permanently failed queue item");
                }
                QueueItemStatus::Completed => {}
            }
        }
        // Enforce the cap on live entries, not counting the leftover this
        // add is about to replace.
        let live = items
            .values()
            .filter(|i| i.key != key)
            .filter(|i| i.status != QueueItemStatus::Completed)
            .count();
        if live >= self.max_size {
            warn!(key = %key, max_size = self.max_size, "Retry queue full, dropping record");
            return false;
        }

        let now = Utc::now();
        items.insert(
            key.clone(),
            QueueItem {
                key: key.clone(),
                record: record.clone(),
                status: QueueItemStatus::Pending,
                retry_count: 0,
                last_error: Some(error.to_string()),
                next_retry_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        debug!(key = %key, error, "Queued record for retry");
        self.save(&items);
        true
    }

    /// Claim the oldest eligible pending item, marking it `processing`.
    pub fn claim(&self) -> Option<QueueItem> {
        let mut items = self.items.lock();
        let now = Utc::now();

        let key = items
            .values()
            .filter(|i| i.status == QueueItemStatus::Pending)
            .filter(|i| i.next_retry_at.is_none_or(|at| at <= now))
            .min_by_key(|i| i.created_at)
            .map(|i| i.key.clone())?;

        let item = items.get_mut(&key)?;
        item.status = QueueItemStatus::Processing;
        item.updated_at = now;
        let claimed = item.clone();
        self.save(&items);
        Some(claimed)
    }

    /// Mark a claimed item as successfully re-driven.
    pub fn complete(&self, key: &str) {
        let mut items = self.items.lock();
        if let Some(item) = items.get_mut(key) {
            item.status = QueueItemStatus::Completed;
            item.updated_at = Utc::now();
            debug!(key, retries = item.retry_count, "Queue item completed");
            self.save(&items);
        }
    }

    /// Record another failure. The item goes back to `pending` with an
    /// exponentially-backed-off eligibility time, or to
    /// `permanently_failed` once the ceiling is reached.
    pub fn fail(&self, key: &str, error: &str) {
        let mut items = self.items.lock();
        let Some(item) = items.get_mut(key) else { return };

        item.retry_count += 1;
        item.last_error = Some(error.to_string());
        item.updated_at = Utc::now();

        if item.retry_count >= self.retry_ceiling {
            item.status = QueueItemStatus::PermanentlyFailed;
            item.next_retry_at = None;
            warn!(key, retries = item.retry_count, error, "Queue item permanently failed");
        } else {
            // base * 2^(n-1) minutes: 5, 10, 20, ...
            let exponent = (item.retry_count - 1).min(16);
            let minutes = self.retry_base_minutes.saturating_mul(1 << exponent);
            item.status = QueueItemStatus::Pending;
            item.next_retry_at = Some(Utc::now() + Duration::minutes(minutes));
            debug!(key, retries = item.retry_count, backoff_minutes = minutes, error,
                   "Queue item rescheduled");
        }
        self.save(&items);
    }

    /// Drop completed items and expired permanent failures past retention.
    pub fn cleanup(&self) -> usize {
        let mut items = self.items.lock();
        let cutoff = Utc::now() - Duration::days(self.retention_days);
        let before = items.len();

        items.retain(|_, item| match item.status {
            QueueItemStatus::Completed => item.updated_at > cutoff,
            QueueItemStatus::PermanentlyFailed => item.updated_at > cutoff,
            _ => true,
        });

        let removed = before - items.len();
        if removed > 0 {
            info!(removed, "Cleaned up retry queue");
            self.save(&items);
        }
        removed
    }

    /// Whether any live (not completed) entry exists for `key`.
    #[must_use]
    pub fn exists(&self, key: &str) -> bool {
        self.items
            .lock()
            .get(key)
            .is_some_and(|i| i.status != QueueItemStatus::Completed)
    }

    /// Permanently failed items, for operator inspection.
    #[must_use]
    pub fn failed_items(&self) -> Vec<QueueItem> {
        self.items
            .lock()
            .values()
            .filter(|i| i.status == QueueItemStatus::PermanentlyFailed)
            .cloned()
            .collect()
    }

    /// Reset a permanently failed item back to a fresh pending state.
    pub fn reset(&self, key: &str) -> bool {
        let mut items = self.items.lock();
        let Some(item) = items.get_mut(key) else { return false };
        if item.status != QueueItemStatus::PermanentlyFailed {
            return false;
        }
        item.status = QueueItemStatus::Pending;
        item.retry_count = 0;
        item.next_retry_at = None;
        item.updated_at = Utc::now();
        info!(key, "Reset permanently failed queue item");
        self.save(&items);
        true
    }

    /// Drop all completed items immediately, regardless of retention.
    pub fn clear_completed(&self) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|_, item| item.status != QueueItemStatus::Completed);
        let removed = before - items.len();
        if removed > 0 {
            self.save(&items);
        }
        removed
    }

    #[must_use]
    pub fn statistics(&self) -> QueueStatistics {
        let items = self.items.lock();
        let now = Utc::now();
        let mut stats = QueueStatistics { total: items.len(), ..Default::default() };
        for item in items.values() {
            match item.status {
                QueueItemStatus::Pending => {
                    // Pending-but-backed-off shows up as failed depth
                    if item.next_retry_at.is_some_and(|at| at > now) {
                        stats.failed += 1;
                    } else {
                        stats.pending += 1;
                    }
                }
                QueueItemStatus::Processing => stats.processing += 1,
                QueueItemStatus::Completed => stats.completed += 1,
                QueueItemStatus::PermanentlyFailed => stats.permanently_failed += 1,
            }
        }
        stats
    }
}
