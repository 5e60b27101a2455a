//! Sync record data structures.
//!
//! A [`SyncRecord`] is one reconciled unit of work: a normalized source
//! record carrying the contact and deal fields destined for the CRM plus
//! the deterministic external id that makes reconciliation idempotent.
//!
//! Records arrive already transformed (phones E.164-normalized, dates
//! formatted); validation here is the single boundary check — a record
//! that fails it is structurally broken and retrying would not fix it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A record that cannot be reconciled because required fields are missing
/// or malformed. Never enqueued for retry.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid phone number: {0:?}")]
    InvalidPhone(String),
    #[error("invalid monetary amount: {0}")]
    InvalidAmount(f64),
}

/// Contact fields destined for the CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactFields {
    /// E.164-normalized phone number
    pub phone: String,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub family_name: String,
    /// Patronymic or middle name, where the source culture has one
    #[serde(default)]
    pub middle_name: Option<String>,
    /// Extra CRM fields passed through verbatim
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl ContactFields {
    /// "Family Given Middle" display form for logging.
    #[must_use]
    pub fn full_name(&self) -> String {
        let mut parts = vec![self.family_name.as_str(), self.given_name.as_str()];
        if let Some(middle) = self.middle_name.as_deref() {
            parts.push(middle);
        }
        parts.retain(|p| !p.trim().is_empty());
        parts.join(" ")
    }
}

/// Deal fields destined for the CRM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DealFields {
    pub title: String,
    /// Stage hint derived from the source record status
    pub stage_id: String,
    pub opportunity: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
    /// Free-text comment carried over from the source system
    #[serde(default)]
    pub comment: Option<String>,
    /// Patient/client card key driving the treatment-plan sync
    #[serde(default)]
    pub card_number: Option<String>,
    /// Structured custom fields passed through verbatim
    #[serde(default)]
    pub custom: BTreeMap<String, Value>,
}

fn default_currency() -> String {
    "RUB".into()
}

/// One reconciled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Deterministic idempotency key, unique per logical source record
    pub external_id: String,
    pub contact: ContactFields,
    pub deal: DealFields,
}

impl SyncRecord {
    /// Boundary validation, applied once before reconciliation.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.external_id.trim().is_empty() {
            return Err(ValidationError::MissingField("external_id"));
        }

        let phone = self.contact.phone.trim();
        if phone.is_empty() {
            return Err(ValidationError::MissingField("contact.phone"));
        }
        let digits = phone.strip_prefix('+').unwrap_or(phone);
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(ValidationError::InvalidPhone(self.contact.phone.clone()));
        }

        if self.contact.given_name.trim().is_empty() && self.contact.family_name.trim().is_empty()
        {
            return Err(ValidationError::MissingField("contact.name"));
        }

        if self.deal.title.trim().is_empty() {
            return Err(ValidationError::MissingField("deal.title"));
        }
        if !self.deal.opportunity.is_finite() || self.deal.opportunity < 0.0 {
            return Err(ValidationError::InvalidAmount(self.deal.opportunity));
        }

        Ok(())
    }
}

/// External-id derivation and collision-avoidance helpers.
///
/// Ids have the shape `F{branch}_{source_id}` (e.g. `F1_12345`). When the
/// base id is already claimed by a closed deal, reconciliation probes
/// suffixed ids (`F1_12345_2`, `F1_12345_3`, …) and, if the probe budget
/// runs out, falls back to a timestamp suffix so it never blocks.
pub mod external_id {
    use chrono::Utc;

    /// Derive the idempotency key for a source record.
    #[must_use]
    pub fn derive(branch_id: u32, source_id: u64) -> String {
        format!("F{branch_id}_{source_id}")
    }

    /// Parse a base id back into (branch_id, source_id). Suffixed ids parse
    /// to their base components.
    #[must_use]
    pub fn parse(id: &str) -> Option<(u32, u64)> {
        let rest = id.strip_prefix('F')?;
        let (branch, rest) = rest.split_once('_')?;
        let source = rest.split('_').next()?;
        Some((branch.parse().ok()?, source.parse().ok()?))
    }

    /// Nth probe candidate for a claimed base id (attempt >= 2).
    #[must_use]
    pub fn suffixed(base: &str, attempt: u32) -> String {
        format!("{base}_{attempt}")
    }

    /// Last-resort id when the probe budget is exhausted.
    #[must_use]
    pub fn timestamp_fallback(base: &str) -> String {
        format!("{base}_t{}", Utc::now().timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_record() -> SyncRecord {
        SyncRecord {
            external_id: "F1_100".into(),
            contact: ContactFields {
                phone: "+79990000000".into(),
                given_name: "Ivan".into(),
                family_name: "Petrov".into(),
                middle_name: None,
                extra: BTreeMap::new(),
            },
            deal: DealFields {
                title: "Appointment 2026-08-01".into(),
                stage_id: "CONSULTATION_SCHEDULED".into(),
                opportunity: 500.0,
                currency: "RUB".into(),
                comment: None,
                card_number: Some("K-1001".into()),
                custom: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(valid_record().validate().is_ok());
    }

    #[test]
    fn test_empty_external_id_rejected() {
        let mut record = valid_record();
        record.external_id = "  ".into();
        assert!(matches!(
            record.validate(),
            Err(ValidationError::MissingField("external_id"))
        ));
    }

    #[test]
    fn test_bad_phone_rejected() {
        let mut record = valid_record();
        record.contact.phone = "not-a-phone".into();
        assert!(matches!(record.validate(), Err(ValidationError::InvalidPhone(_))));

        record.contact.phone = String::new();
        assert!(matches!(
            record.validate(),
            Err(ValidationError::MissingField("contact.phone"))
        ));
    }

    #[test]
    fn test_nameless_contact_rejected() {
        let mut record = valid_record();
        record.contact.given_name.clear();
        record.contact.family_name.clear();
        assert!(matches!(
            record.validate(),
            Err(ValidationError::MissingField("contact.name"))
        ));
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut record = valid_record();
        record.deal.opportunity = -1.0;
        assert!(matches!(record.validate(), Err(ValidationError::InvalidAmount(_))));

        record.deal.opportunity = f64::NAN;
        assert!(matches!(record.validate(), Err(ValidationError::InvalidAmount(_))));
    }

    #[test]
    fn test_full_name_skips_empty_parts() {
        let record = valid_record();
        assert_eq!(record.contact.full_name(), "Petrov Ivan");

        let mut with_middle = valid_record();
        with_middle.contact.middle_name = Some("Sergeevich".into());
        assert_eq!(with_middle.contact.full_name(), "Petrov Ivan Sergeevich");
    }

    #[test]
    fn test_serde_roundtrip() {
        let record = valid_record();
        let json = serde_json::to_string(&record).unwrap();
        let back: SyncRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.external_id, record.external_id);
        assert_eq!(back.deal.opportunity, record.deal.opportunity);
        assert_eq!(back.deal.card_number, record.deal.card_number);
    }

    mod external_id {
        use crate::record::external_id::*;

        #[test]
        fn test_derive_and_parse() {
            assert_eq!(derive(1, 12345), "F1_12345");
            assert_eq!(derive(3, 67890), "F3_67890");
            assert_eq!(parse("F1_12345"), Some((1, 12345)));
            assert_eq!(parse("F3_67890_2"), Some((3, 67890)));
            assert_eq!(parse("garbage"), None);
            assert_eq!(parse("F_"), None);
        }

        #[test]
        fn test_suffixed() {
            assert_eq!(suffixed("F1_100", 2), "F1_100_2");
            assert_eq!(suffixed("F1_100", 7), "F1_100_7");
        }

        #[test]
        fn test_timestamp_fallback_keeps_base() {
            let id = timestamp_fallback("F1_100");
            assert!(id.starts_with("F1_100_t"));
            assert!(id.len() > "F1_100_t".len());
        }
    }
}
