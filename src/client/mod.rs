//! Rate-limited CRM webhook client.
//!
//! Every operation is an HTTP POST to `{webhook_base}/{method}` with a JSON
//! body. The API reports failures two ways: transport-level status codes,
//! and an `error`/`error_description` pair inside an otherwise-successful
//! 200 response. Both are folded into [`ApiError`] here so callers see one
//! taxonomy.
//!
//! All requests flow through the shared [`RateLimiter`] and a bounded
//! retry loop; only transient classes (rate limits, 5xx, transport
//! failures) are retried. Auth failures are surfaced immediately so the
//! orchestrator can abort the cycle instead of hammering a dead token.

pub mod rate_limiter;
pub mod types;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::metrics;
use crate::record::{ContactFields, DealFields};
use crate::retry::{retry_if, RetryConfig};

pub use rate_limiter::RateLimiter;
pub use types::{
    DealUpdate, RemoteContact, RemoteDeal, RemoteLead, CARD_NUMBER_FIELD, EXTERNAL_ID_FIELD,
    TREATMENT_PLAN_FIELD, TREATMENT_PLAN_HASH_FIELD,
};

/// Max commands per batch request, imposed by the API.
pub const BATCH_COMMAND_LIMIT: usize = 50;

/// Failure talking to the CRM API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Webhook token rejected. Never retried; aborts the current cycle.
    #[error("authentication rejected by CRM")]
    Auth,

    /// Explicit throttle signal (HTTP 429 or QUERY_LIMIT_EXCEEDED).
    #[error("CRM rate limit exceeded")]
    RateLimited,

    /// Transport-level failure (connect, timeout, TLS).
    #[error("transport error: {0}")]
    Transient(String),

    /// Server-side failure.
    #[error("CRM server error (status {status})")]
    Server { status: u16 },

    /// 200 response whose body is not the expected JSON shape.
    #[error("malformed CRM response: {0}")]
    MalformedResponse(String),

    /// Application-level error reported in the response body.
    #[error("CRM error {code}: {description}")]
    Api { code: String, description: String },

    /// Webhook URL failed validation at startup.
    #[error("invalid webhook URL: {0}")]
    InvalidUrl(String),
}

impl ApiError {
    /// Whether a retry might succeed. Auth and application errors never
    /// clear on their own.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited | Self::Transient(_) | Self::Server { .. })
    }

    /// Whether this failure invalidates the whole cycle, not just one record.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth)
    }
}

/// The CRM surface the reconciliation engine needs. Implemented by
/// [`CrmClient`] in production and by in-memory fakes in tests.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Look up the deal tagged with `external_id`, if any.
    async fn find_deal_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RemoteDeal>, ApiError>;

    /// All contacts registered under `phone`. Shared family phones return
    /// several; name matching happens in the caller.
    async fn find_all_contacts_by_phone(&self, phone: &str)
        -> Result<Vec<RemoteContact>, ApiError>;

    /// Open deals of `contact_id` that carry no external id, newest first.
    async fn find_unlinked_open_deals(&self, contact_id: u64)
        -> Result<Vec<RemoteDeal>, ApiError>;

    async fn create_contact(&self, contact: &ContactFields) -> Result<u64, ApiError>;

    async fn create_deal(
        &self,
        deal: &DealFields,
        external_id: &str,
        contact_id: u64,
    ) -> Result<u64, ApiError>;

    async fn update_deal(&self, deal_id: u64, update: &DealUpdate) -> Result<(), ApiError>;

    /// Bulk contact lookup keyed by phone. Absent keys mean the lookup for
    /// that phone failed inside the batch and a live call is needed.
    async fn batch_find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Vec<RemoteContact>>, ApiError>;

    /// Bulk deal lookup keyed by external id. `Some(None)` means the id is
    /// definitively unclaimed; an absent key means the lookup failed.
    async fn batch_find_deals_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Option<RemoteDeal>>, ApiError>;

    /// Bulk lead lookup keyed by phone, for cycle observability.
    async fn batch_find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Vec<RemoteLead>>, ApiError>;

    /// Cheap authenticated call verifying the webhook works.
    async fn test_connection(&self) -> Result<(), ApiError>;
}

/// Production [`CrmApi`] implementation over HTTPS.
pub struct CrmClient {
    http: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter,
    retry: RetryConfig,
    default_assigned_by_id: Option<u64>,
}

impl CrmClient {
    pub fn new(config: &SyncConfig) -> Result<Self, ApiError> {
        let base_url = config.webhook_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ApiError::InvalidUrl("webhook_url is not configured".into()));
        }
        if !base_url.starts_with("https://") && !base_url.starts_with("http://") {
            return Err(ApiError::InvalidUrl(base_url));
        }

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        Ok(Self {
            http,
            base_url,
            rate_limiter: RateLimiter::new(config.rate_per_second, config.rate_per_minute),
            retry: RetryConfig::with_max_attempts(config.max_attempts),
            default_assigned_by_id: config.default_assigned_by_id,
        })
    }

    async fn call_once(&self, method: &str, params: &Value) -> Result<Value, ApiError> {
        self.rate_limiter.acquire().await;

        let url = format!("{}/{}", self.base_url, method);
        let response = self
            .http
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|e| ApiError::Transient(e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => return Err(ApiError::Auth),
            429 => return Err(ApiError::RateLimited),
            s if status.is_server_error() => return Err(ApiError::Server { status: s }),
            _ => {}
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;

        // The API reports application errors inside 200 responses.
        if let Some(code) = body.get("error").and_then(Value::as_str) {
            let description = body
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Err(match code {
                "QUERY_LIMIT_EXCEEDED" => ApiError::RateLimited,
                "expired_token" | "invalid_token" | "NO_AUTH_FOUND" => ApiError::Auth,
                _ => ApiError::Api { code: code.to_string(), description },
            });
        }

        Ok(body)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ApiError> {
        let timer = metrics::LatencyTimer::start(method);
        let result = retry_if(method, &self.retry, ApiError::is_retryable, || {
            self.call_once(method, &params)
        })
        .await;
        timer.finish(result.is_ok());
        result
    }

    fn result_array(body: &Value) -> Vec<Value> {
        match body.get("result") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    fn result_id(body: &Value) -> Result<u64, ApiError> {
        body.get("result")
            .and_then(types::parse_id)
            .ok_or_else(|| ApiError::MalformedResponse("create response carried no id".into()))
    }

    /// Execute raw batch commands, chunked to the API's 50-command limit.
    /// Per-command errors are logged and dropped; the key is simply absent
    /// from the result, which callers treat as "do a live lookup".
    async fn batch_execute(
        &self,
        commands: &[(String, String)],
    ) -> Result<HashMap<String, Value>, ApiError> {
        let mut results = HashMap::with_capacity(commands.len());

        for chunk in commands.chunks(BATCH_COMMAND_LIMIT) {
            let cmd: serde_json::Map<String, Value> = chunk
                .iter()
                .map(|(key, query)| (key.clone(), json!(query)))
                .collect();

            let body = self.call("batch", json!({ "halt": 0, "cmd": cmd })).await?;
            metrics::record_batch_size(chunk.len());

            let batch_result = body.get("result").cloned().unwrap_or(Value::Null);
            if let Some(errors) = batch_result.get("result_error").and_then(Value::as_object) {
                for (key, error) in errors {
                    warn!(command = %key, error = %error, "Batch command failed");
                }
            }
            if let Some(per_command) = batch_result.get("result").and_then(Value::as_object) {
                for (key, value) in per_command {
                    results.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(results)
    }
}

/// Escape a value for use inside a batch command query string. `+` must
/// become `%2B` or the API silently strips it from phone filters.
fn escape_query(value: &str) -> String {
    value.replace('+', "%2B")
}

const CONTACT_SELECT: &str =
    "select[]=ID&select[]=NAME&select[]=LAST_NAME&select[]=SECOND_NAME&select[]=PHONE";

fn deal_select() -> String {
    format!(
        "select[]=ID&select[]=STAGE_ID&select[]=CONTACT_ID&select[]=DATE_CREATE&select[]=OPPORTUNITY&select[]={EXTERNAL_ID_FIELD}"
    )
}

fn deal_select_json() -> Value {
    json!(["ID", "STAGE_ID", "CONTACT_ID", "DATE_CREATE", "OPPORTUNITY", EXTERNAL_ID_FIELD])
}

fn contact_select_json() -> Value {
    json!(["ID", "NAME", "LAST_NAME", "SECOND_NAME", "PHONE"])
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn find_deal_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RemoteDeal>, ApiError> {
        let body = self
            .call(
                "crm.deal.list",
                json!({
                    "filter": { EXTERNAL_ID_FIELD: external_id },
                    "select": deal_select_json(),
                }),
            )
            .await?;

        Ok(Self::result_array(&body).iter().find_map(RemoteDeal::from_value))
    }

    async fn find_all_contacts_by_phone(
        &self,
        phone: &str,
    ) -> Result<Vec<RemoteContact>, ApiError> {
        let body = self
            .call(
                "crm.contact.list",
                json!({
                    "filter": { "PHONE": phone },
                    "select": contact_select_json(),
                }),
            )
            .await?;

        Ok(Self::result_array(&body)
            .iter()
            .filter_map(RemoteContact::from_value)
            .collect())
    }

    async fn find_unlinked_open_deals(
        &self,
        contact_id: u64,
    ) -> Result<Vec<RemoteDeal>, ApiError> {
        let body = self
            .call(
                "crm.deal.list",
                json!({
                    "filter": { "CONTACT_ID": contact_id, "CLOSED": "N" },
                    "order": { "DATE_CREATE": "DESC" },
                    "select": deal_select_json(),
                }),
            )
            .await?;

        Ok(Self::result_array(&body)
            .iter()
            .filter_map(RemoteDeal::from_value)
            .filter(|d| d.external_id.as_deref().is_none_or(str::is_empty))
            .collect())
    }

    async fn create_contact(&self, contact: &ContactFields) -> Result<u64, ApiError> {
        let mut fields = serde_json::Map::new();
        fields.insert("NAME".into(), json!(contact.given_name));
        fields.insert("LAST_NAME".into(), json!(contact.family_name));
        if let Some(middle) = &contact.middle_name {
            fields.insert("SECOND_NAME".into(), json!(middle));
        }
        fields.insert(
            "PHONE".into(),
            json!([{ "VALUE": contact.phone, "VALUE_TYPE": "WORK" }]),
        );
        if let Some(assigned) = self.default_assigned_by_id {
            fields.insert("ASSIGNED_BY_ID".into(), json!(assigned));
        }
        for (key, value) in &contact.extra {
            fields.insert(key.clone(), value.clone());
        }

        let body = self
            .call("crm.contact.add", json!({ "fields": Value::Object(fields) }))
            .await?;
        let id = Self::result_id(&body)?;
        debug!(contact_id = id, phone = %contact.phone, "Created contact");
        Ok(id)
    }

    async fn create_deal(
        &self,
        deal: &DealFields,
        external_id: &str,
        contact_id: u64,
    ) -> Result<u64, ApiError> {
        let mut fields = DealUpdate::from_fields(deal)
            .with_external_id(external_id)
            .to_fields_value();
        if let Some(obj) = fields.as_object_mut() {
            obj.insert("CONTACT_ID".into(), json!(contact_id));
            if let Some(assigned) = self.default_assigned_by_id {
                obj.insert("ASSIGNED_BY_ID".into(), json!(assigned));
            }
        }

        let body = self.call("crm.deal.add", json!({ "fields": fields })).await?;
        let id = Self::result_id(&body)?;
        debug!(deal_id = id, external_id, "Created deal");
        Ok(id)
    }

    async fn update_deal(&self, deal_id: u64, update: &DealUpdate) -> Result<(), ApiError> {
        self.call(
            "crm.deal.update",
            json!({ "id": deal_id, "fields": update.to_fields_value() }),
        )
        .await?;
        Ok(())
    }

    async fn batch_find_contacts_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Vec<RemoteContact>>, ApiError> {
        let commands: Vec<(String, String)> = phones
            .iter()
            .enumerate()
            .map(|(i, phone)| {
                (
                    format!("c{i}"),
                    format!(
                        "crm.contact.list?filter[PHONE]={}&{CONTACT_SELECT}",
                        escape_query(phone)
                    ),
                )
            })
            .collect();

        let raw = self.batch_execute(&commands).await?;
        let mut out = HashMap::new();
        for (i, phone) in phones.iter().enumerate() {
            if let Some(Value::Array(items)) = raw.get(&format!("c{i}")) {
                out.insert(
                    phone.clone(),
                    items.iter().filter_map(RemoteContact::from_value).collect(),
                );
            }
        }
        Ok(out)
    }

    async fn batch_find_deals_by_external_ids(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, Option<RemoteDeal>>, ApiError> {
        let commands: Vec<(String, String)> = external_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    format!("d{i}"),
                    format!(
                        "crm.deal.list?filter[{EXTERNAL_ID_FIELD}]={}&{}",
                        escape_query(id),
                        deal_select()
                    ),
                )
            })
            .collect();

        let raw = self.batch_execute(&commands).await?;
        let mut out = HashMap::new();
        for (i, id) in external_ids.iter().enumerate() {
            if let Some(Value::Array(items)) = raw.get(&format!("d{i}")) {
                out.insert(id.clone(), items.iter().find_map(RemoteDeal::from_value));
            }
        }
        Ok(out)
    }

    async fn batch_find_leads_by_phones(
        &self,
        phones: &[String],
    ) -> Result<HashMap<String, Vec<RemoteLead>>, ApiError> {
        let commands: Vec<(String, String)> = phones
            .iter()
            .enumerate()
            .map(|(i, phone)| {
                (
                    format!("l{i}"),
                    format!(
                        "crm.lead.list?filter[PHONE]={}&select[]=ID&select[]=TITLE&select[]=STATUS_ID",
                        escape_query(phone)
                    ),
                )
            })
            .collect();

        let raw = self.batch_execute(&commands).await?;
        let mut out = HashMap::new();
        for (i, phone) in phones.iter().enumerate() {
            if let Some(Value::Array(items)) = raw.get(&format!("l{i}")) {
                out.insert(
                    phone.clone(),
                    items.iter().filter_map(RemoteLead::from_value).collect(),
                );
            }
        }
        Ok(out)
    }

    async fn test_connection(&self) -> Result<(), ApiError> {
        self.call("profile", json!({})).await?;
        Ok(())
    }
}
