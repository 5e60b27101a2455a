//! Reconciliation engine.
//!
//! Takes a batch of normalized source records and converges the CRM toward
//! them. The algorithm per record:
//!
//! 1. Look up the deal claimed by the record's external id.
//! 2. If it exists: update it (fully when open, stage withheld when a human
//!    parked it in a protected stage). A closed deal releases the id — the
//!    record represents a *new* visit, so suffixed ids are probed until a
//!    free one or an open suffixed deal is found.
//! 3. If no deal claims the id: resolve the contact by phone + name
//!    (creating it when absent), then prefer attaching the newest untagged
//!    open deal over creating a duplicate.
//! 4. Treatment-plan sync afterwards, strictly best-effort.
//!
//! Failure policy: invalid records are dropped up front, fatal API errors
//! (auth) abort the batch, everything else parks the record in the durable
//! queue and the batch continues.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::{ApiError, CrmApi, DealUpdate, RemoteContact, RemoteDeal};
use crate::metrics;
use crate::plans::PlanSyncManager;
use crate::queue::DurableQueue;
use crate::record::{external_id, SyncRecord, ValidationError};
use crate::stage::{StageClass, StagePolicy};

/// Why one record failed to reconcile.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Structurally broken record; dropped, never queued.
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),
    /// API failure; queued for redrive unless fatal.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// Result summary of one [`ReconciliationEngine::process_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub succeeded: usize,
    pub queued: usize,
    pub dropped_invalid: usize,
}

/// Bulk-prefetched CRM state shared across one batch.
///
/// An absent key means "not prefetched, do a live lookup"; a present key
/// holds the definitive answer (including "definitely absent"). The
/// `new_contacts` map dedups contact creation when several records in the
/// same batch share a phone the prefetch predates.
#[derive(Debug, Default)]
pub struct BatchContext {
    deals: HashMap<String, Option<RemoteDeal>>,
    contacts: HashMap<String, Vec<RemoteContact>>,
    new_contacts: HashMap<String, u64>,
}

enum IdTarget {
    /// No deal claims this id; create under it.
    Fresh(String),
    /// An updatable deal claims the id; converge it.
    Attach(RemoteDeal),
}

pub struct ReconciliationEngine {
    api: Arc<dyn CrmApi>,
    queue: Arc<DurableQueue>,
    plans: Option<Arc<PlanSyncManager>>,
    stages: StagePolicy,
    id_probe_limit: u32,
    prefetch_leads: bool,
}

impl ReconciliationEngine {
    pub fn new(
        api: Arc<dyn CrmApi>,
        queue: Arc<DurableQueue>,
        plans: Option<Arc<PlanSyncManager>>,
        stages: StagePolicy,
        id_probe_limit: u32,
        prefetch_leads: bool,
    ) -> Self {
        Self {
            api,
            queue,
            plans,
            stages,
            id_probe_limit: id_probe_limit.max(2),
            prefetch_leads,
        }
    }

    /// Reconcile a batch of records. Per-record failures are parked in the
    /// retry queue; only fatal API errors abort the whole batch.
    pub async fn process_batch(&self, records: &[SyncRecord]) -> Result<BatchOutcome, ApiError> {
        let mut outcome = BatchOutcome { processed: records.len(), ..Default::default() };

        let mut valid = Vec::with_capacity(records.len());
        for record in records {
            match record.validate() {
                Ok(()) => valid.push(record),
                Err(e) => {
                    warn!(external_id = %record.external_id, error = %e,
                          "Dropping invalid record");
                    metrics::record_reconcile_outcome("invalid");
                    outcome.dropped_invalid += 1;
                }
            }
        }

        let mut ctx = self.prefetch(&valid).await?;

        let mut plan_targets = Vec::new();
        for record in valid {
            match self.reconcile(record, &mut ctx).await {
                Ok(deal_id) => {
                    outcome.succeeded += 1;
                    self.queue.complete(&record.external_id);
                    if let Some(card) = &record.deal.card_number {
                        plan_targets.push((card.clone(), deal_id));
                    }
                }
                Err(SyncError::Api(e)) if e.is_fatal() => {
                    warn!(external_id = %record.external_id, error = %e,
                          "Fatal API error, aborting batch");
                    return Err(e);
                }
                Err(e) => {
                    metrics::record_reconcile_outcome("queued");
                    if self.queue.add(record, &e.to_string()) {
                        outcome.queued += 1;
                    }
                }
            }
        }

        // Best-effort plan propagation for whatever reconciled cleanly
        if let Some(plans) = &self.plans {
            if !plan_targets.is_empty() {
                let pushed = plans.sync_plans_batch(&plan_targets).await;
                debug!(candidates = plan_targets.len(), pushed, "Treatment plan pass done");
            }
        }

        Ok(outcome)
    }

    /// Reconcile a single record outside any batch (queue redrive path).
    pub async fn reconcile_one(&self, record: &SyncRecord) -> Result<u64, SyncError> {
        record.validate()?;
        let mut ctx = BatchContext::default();
        let deal_id = self.reconcile(record, &mut ctx).await?;

        if let (Some(plans), Some(card)) = (&self.plans, &record.deal.card_number) {
            plans.sync_plan_for_deal(card, deal_id).await;
        }
        Ok(deal_id)
    }

    async fn prefetch(&self, records: &[&SyncRecord]) -> Result<BatchContext, ApiError> {
        if records.is_empty() {
            return Ok(BatchContext::default());
        }

        let mut ids: Vec<String> = records.iter().map(|r| r.external_id.clone()).collect();
        ids.sort();
        ids.dedup();
        let mut phones: Vec<String> = records.iter().map(|r| r.contact.phone.clone()).collect();
        phones.sort();
        phones.dedup();

        let deals = match self.api.batch_find_deals_by_external_ids(&ids).await {
            Ok(map) => map,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Deal prefetch failed, falling back to live lookups");
                HashMap::new()
            }
        };
        let contacts = match self.api.batch_find_contacts_by_phones(&phones).await {
            Ok(map) => map,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Contact prefetch failed, falling back to live lookups");
                HashMap::new()
            }
        };

        if self.prefetch_leads {
            match self.api.batch_find_leads_by_phones(&phones).await {
                Ok(leads) => {
                    let total: usize = leads.values().map(Vec::len).sum();
                    debug!(phones = phones.len(), leads = total, "Lead prefetch");
                }
                Err(e) => debug!(error = %e, "Lead prefetch failed"),
            }
        }

        debug!(
            deals = deals.len(),
            contacts = contacts.len(),
            records = records.len(),
            "Prefetched batch state"
        );
        Ok(BatchContext { deals, contacts, new_contacts: HashMap::new() })
    }

    async fn reconcile(
        &self,
        record: &SyncRecord,
        ctx: &mut BatchContext,
    ) -> Result<u64, SyncError> {
        match self.resolve_external_id(record, ctx).await? {
            IdTarget::Attach(mut deal) => {
                let protected = self.stages.classify(&deal.stage_id) == StageClass::Protected;
                let mut update = DealUpdate::from_fields(&record.deal);
                if protected {
                    update = update.without_stage();
                }
                self.api.update_deal(deal.id, &update).await?;

                let outcome = if protected { "updated_protected" } else { "updated" };
                metrics::record_reconcile_outcome(outcome);
                debug!(external_id = %record.external_id, deal_id = deal.id,
                       stage = %deal.stage_id, protected, "Updated deal");

                // Later records in the batch resolving the same id must see
                // the converged deal, not the prefetched snapshot.
                let deal_id = deal.id;
                if !protected {
                    deal.stage_id = record.deal.stage_id.clone();
                }
                deal.opportunity = record.deal.opportunity;
                let key = deal.external_id.clone().unwrap_or_else(|| record.external_id.clone());
                ctx.deals.insert(key, Some(deal));
                Ok(deal_id)
            }
            IdTarget::Fresh(id) => self.create_path(record, &id, ctx).await,
        }
    }

    /// Resolve which deal, if any, the record's external id should land on.
    ///
    /// A final deal under the base id releases it: the record is a new
    /// visit and must not reopen closed history, so suffixed ids are
    /// probed. An open deal found under a suffix is the attach target; a
    /// closed or protected one keeps the probe going.
    async fn resolve_external_id(
        &self,
        record: &SyncRecord,
        ctx: &BatchContext,
    ) -> Result<IdTarget, SyncError> {
        let base = &record.external_id;
        let Some(deal) = self.lookup_deal(base, ctx).await? else {
            return Ok(IdTarget::Fresh(base.clone()));
        };

        if self.stages.classify(&deal.stage_id) != StageClass::Final {
            return Ok(IdTarget::Attach(deal));
        }

        debug!(external_id = %base, deal_id = deal.id, stage = %deal.stage_id,
               "Base id claimed by closed deal, probing suffixes");
        for attempt in 2..=self.id_probe_limit {
            let candidate = external_id::suffixed(base, attempt);
            match self.lookup_deal(&candidate, ctx).await? {
                None => return Ok(IdTarget::Fresh(candidate)),
                Some(deal) if self.stages.classify(&deal.stage_id) == StageClass::Open => {
                    debug!(external_id = %candidate, deal_id = deal.id,
                           "Found open deal under suffixed id");
                    return Ok(IdTarget::Attach(deal));
                }
                Some(_) => continue,
            }
        }

        let fallback = external_id::timestamp_fallback(base);
        warn!(external_id = %base, probe_limit = self.id_probe_limit, fallback = %fallback,
              "Suffix probe budget exhausted, using timestamp id");
        Ok(IdTarget::Fresh(fallback))
    }

    async fn lookup_deal(
        &self,
        id: &str,
        ctx: &BatchContext,
    ) -> Result<Option<RemoteDeal>, ApiError> {
        if let Some(cached) = ctx.deals.get(id) {
            return Ok(cached.clone());
        }
        self.api.find_deal_by_external_id(id).await
    }

    /// No deal claims the id: resolve the contact, then attach an existing
    /// untagged open deal or create a fresh one.
    async fn create_path(
        &self,
        record: &SyncRecord,
        id: &str,
        ctx: &mut BatchContext,
    ) -> Result<u64, SyncError> {
        let contact_id = self.resolve_contact(record, ctx).await?;

        let candidates = self.api.find_unlinked_open_deals(contact_id).await?;
        if let Some(target) = candidates.first() {
            if candidates.len() > 1 {
                info!(contact_id, candidates = candidates.len(),
                      "Multiple untagged open deals, attaching newest");
            }
            let update = DealUpdate::from_fields(&record.deal).with_external_id(id);
            self.api.update_deal(target.id, &update).await?;
            metrics::record_reconcile_outcome("attached");
            info!(external_id = %id, deal_id = target.id, contact_id,
                  "Attached record to existing open deal");

            let mut attached = target.clone();
            attached.stage_id = record.deal.stage_id.clone();
            attached.opportunity = record.deal.opportunity;
            attached.external_id = Some(id.to_string());
            let attached_id = attached.id;
            ctx.deals.insert(id.to_string(), Some(attached));
            return Ok(attached_id);
        }

        let deal_id = self.api.create_deal(&record.deal, id, contact_id).await?;
        metrics::record_reconcile_outcome("created");
        info!(external_id = %id, deal_id, contact_id, "Created deal");

        // Same-batch duplicates of this id attach to the new deal instead
        // of creating another one.
        ctx.deals.insert(
            id.to_string(),
            Some(RemoteDeal {
                id: deal_id,
                stage_id: record.deal.stage_id.clone(),
                contact_id: Some(contact_id),
                external_id: Some(id.to_string()),
                created_at: Some(chrono::Utc::now()),
                opportunity: record.deal.opportunity,
            }),
        );
        Ok(deal_id)
    }

    /// Find or create the contact for a record. Identity is phone plus
    /// case-insensitive name: a shared phone with a different name is a
    /// family member and gets their own contact.
    async fn resolve_contact(
        &self,
        record: &SyncRecord,
        ctx: &mut BatchContext,
    ) -> Result<u64, SyncError> {
        let phone = &record.contact.phone;

        if let Some(&id) = ctx.new_contacts.get(phone) {
            return Ok(id);
        }

        let existing = match ctx.contacts.get(phone) {
            Some(cached) => cached.clone(),
            None => self.api.find_all_contacts_by_phone(phone).await?,
        };

        if let Some(found) = existing
            .iter()
            .find(|c| c.matches_name(&record.contact.given_name, &record.contact.family_name))
        {
            return Ok(found.id);
        }
        if !existing.is_empty() {
            info!(phone = %phone, existing = existing.len(),
                  name = %record.contact.full_name(),
                  "Phone shared with other contacts, creating family member");
        }

        let id = self.api.create_contact(&record.contact).await?;
        ctx.new_contacts.insert(phone.clone(), id);
        metrics::record_reconcile_outcome("contact_created");
        Ok(id)
    }
}
