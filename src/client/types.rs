//! Wire types for the CRM webhook API.
//!
//! The API is JSON over POST but numerically sloppy: entity ids arrive as
//! strings in list responses and as numbers in create responses, so all
//! parsing goes through tolerant helpers instead of direct deserialization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::record::DealFields;

/// Custom field holding the external id on deals.
pub const EXTERNAL_ID_FIELD: &str = "UF_CRM_EXTERNAL_ID";
/// Custom field holding the patient card number on deals.
pub const CARD_NUMBER_FIELD: &str = "UF_CRM_CARD_NUMBER";
/// Custom field holding the rendered treatment plan on deals.
pub const TREATMENT_PLAN_FIELD: &str = "UF_CRM_TREATMENT_PLAN";
/// Custom field holding the treatment plan content hash on deals.
pub const TREATMENT_PLAN_HASH_FIELD: &str = "UF_CRM_TREATMENT_PLAN_HASH";

/// Parse an id that the API serializes as either a JSON string or number.
pub(crate) fn parse_id(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_str(entity: &Value, key: &str) -> Option<String> {
    match entity.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A contact as returned by the CRM.
#[derive(Debug, Clone)]
pub struct RemoteContact {
    pub id: u64,
    pub phone: Option<String>,
    pub given_name: String,
    pub family_name: String,
    pub middle_name: Option<String>,
}

impl RemoteContact {
    /// Parse one entry of a `crm.contact.list` result. Entries without a
    /// parseable ID are skipped by callers.
    pub(crate) fn from_value(entity: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(entity.get("ID")?)?,
            phone: entity
                .get("PHONE")
                .and_then(|p| p.as_array())
                .and_then(|a| a.first())
                .and_then(|e| field_str(e, "VALUE")),
            given_name: field_str(entity, "NAME").unwrap_or_default(),
            family_name: field_str(entity, "LAST_NAME").unwrap_or_default(),
            middle_name: field_str(entity, "SECOND_NAME"),
        })
    }

    /// Case-insensitive, whitespace-tolerant name identity. Same phone with
    /// a different name is a family member, not this person.
    #[must_use]
    pub fn matches_name(&self, given_name: &str, family_name: &str) -> bool {
        fn norm(s: &str) -> String {
            s.trim().to_lowercase()
        }
        norm(&self.given_name) == norm(given_name) && norm(&self.family_name) == norm(family_name)
    }
}

/// A deal as returned by the CRM.
#[derive(Debug, Clone)]
pub struct RemoteDeal {
    pub id: u64,
    pub stage_id: String,
    pub contact_id: Option<u64>,
    pub external_id: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub opportunity: f64,
}

impl RemoteDeal {
    pub(crate) fn from_value(entity: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(entity.get("ID")?)?,
            stage_id: field_str(entity, "STAGE_ID").unwrap_or_default(),
            contact_id: entity.get("CONTACT_ID").and_then(parse_id),
            external_id: field_str(entity, EXTERNAL_ID_FIELD),
            created_at: field_str(entity, "DATE_CREATE")
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
            opportunity: field_str(entity, "OPPORTUNITY")
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        })
    }
}

/// A lead as returned by the CRM. Prefetched for observability only.
#[derive(Debug, Clone)]
pub struct RemoteLead {
    pub id: u64,
    pub title: String,
    pub status_id: String,
}

impl RemoteLead {
    pub(crate) fn from_value(entity: &Value) -> Option<Self> {
        Some(Self {
            id: parse_id(entity.get("ID")?)?,
            title: field_str(entity, "TITLE").unwrap_or_default(),
            status_id: field_str(entity, "STATUS_ID").unwrap_or_default(),
        })
    }
}

/// A partial deal update. Only the populated fields are sent, so the same
/// type serves full updates, stage-preserving updates on protected deals,
/// and plan-only pushes.
#[derive(Debug, Clone, Default)]
pub struct DealUpdate {
    pub title: Option<String>,
    pub stage_id: Option<String>,
    pub opportunity: Option<f64>,
    pub currency: Option<String>,
    pub comment: Option<String>,
    pub card_number: Option<String>,
    pub external_id: Option<String>,
    pub treatment_plan: Option<String>,
    pub plan_hash: Option<String>,
    pub custom: BTreeMap<String, Value>,
}

impl DealUpdate {
    /// Full update carrying every field of the source record.
    #[must_use]
    pub fn from_fields(deal: &DealFields) -> Self {
        Self {
            title: Some(deal.title.clone()),
            stage_id: Some(deal.stage_id.clone()),
            opportunity: Some(deal.opportunity),
            currency: Some(deal.currency.clone()),
            comment: deal.comment.clone(),
            card_number: deal.card_number.clone(),
            custom: deal.custom.clone(),
            ..Self::default()
        }
    }

    /// Same update with the stage withheld, for protected deals.
    #[must_use]
    pub fn without_stage(mut self) -> Self {
        self.stage_id = None;
        self
    }

    #[must_use]
    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    /// Update touching only the treatment-plan fields.
    #[must_use]
    pub fn plan_only(plan_text: String, plan_hash: String) -> Self {
        Self {
            treatment_plan: Some(plan_text),
            plan_hash: Some(plan_hash),
            ..Self::default()
        }
    }

    /// Wire representation for `crm.deal.update` / `crm.deal.add`.
    #[must_use]
    pub fn to_fields_value(&self) -> Value {
        let mut fields = serde_json::Map::new();
        if let Some(v) = &self.title {
            fields.insert("TITLE".into(), json!(v));
        }
        if let Some(v) = &self.stage_id {
            fields.insert("STAGE_ID".into(), json!(v));
        }
        if let Some(v) = self.opportunity {
            fields.insert("OPPORTUNITY".into(), json!(v));
        }
        if let Some(v) = &self.currency {
            fields.insert("CURRENCY_ID".into(), json!(v));
        }
        if let Some(v) = &self.comment {
            fields.insert("COMMENTS".into(), json!(v));
        }
        if let Some(v) = &self.card_number {
            fields.insert(CARD_NUMBER_FIELD.into(), json!(v));
        }
        if let Some(v) = &self.external_id {
            fields.insert(EXTERNAL_ID_FIELD.into(), json!(v));
        }
        if let Some(v) = &self.treatment_plan {
            fields.insert(TREATMENT_PLAN_FIELD.into(), json!(v));
        }
        if let Some(v) = &self.plan_hash {
            fields.insert(TREATMENT_PLAN_HASH_FIELD.into(), json!(v));
        }
        for (key, value) in &self.custom {
            fields.insert(key.clone(), value.clone());
        }
        Value::Object(fields)
    }
}
