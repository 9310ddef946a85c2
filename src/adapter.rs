//! JSON request dispatch behind the `alertledger-adapter` binary.

use chrono::NaiveDateTime;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use thiserror::Error;

use crate::alert_parser::parse_amount_text_to_cents;
use crate::classifier::{CachedClassifier, RuleClassifier};
use crate::config::LedgerConfig;
use crate::coverage_store::load_coverage;
use crate::error::LedgerError;
use crate::ledger_db::{inspect_status_at_path, open_and_migrate};
use crate::mail_source::{AlertQuery, EmlDirSource};
use crate::rules_store::{RulesStore, SpecialRule};
use crate::sync_range::{Interval, SyncRangeReconciler};
use crate::timestamps::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::transaction_store::{
    add_manual_transaction, count_transactions, set_transaction_exclusion, CategoryFilter,
    ManualTransaction, TransactionQuery,
};
use crate::transaction_sync::TransactionSync;

pub const SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Deserialize)]
pub struct AdapterRequest {
    pub schema_version: u64,
    pub endpoint: AdapterEndpoint,
    #[serde(default)]
    pub query: Value,
    #[serde(default)]
    pub dataset: Option<AdapterDataset>,
}

#[derive(Debug, Deserialize)]
pub struct AdapterEndpoint {
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdapterDataset {
    pub db_path: Option<String>,
    pub mail_dir: Option<String>,
    pub rules_dir: Option<String>,
}

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("{0}")]
    Protocol(String),

    #[error("unsupported endpoint path: {0}")]
    UnsupportedEndpoint(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl AdapterError {
    pub fn category(&self) -> &'static str {
        match self {
            AdapterError::Protocol(_) => "ADAPTER_PROTOCOL_ERROR",
            AdapterError::UnsupportedEndpoint(_) => "UNSUPPORTED_ENDPOINT",
            AdapterError::Ledger(err) => err.category(),
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            AdapterError::Protocol(_) | AdapterError::UnsupportedEndpoint(_) => "AdapterError",
            AdapterError::Ledger(LedgerError::Sync(_)) => "SyncRangeError",
            AdapterError::Ledger(_) => "LedgerError",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AdapterErrorBody {
    pub category: String,
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status")]
pub enum AdapterResponse {
    #[serde(rename = "success")]
    Success { payload: Value },
    #[serde(rename = "error")]
    Error { error: AdapterErrorBody },
}

impl AdapterResponse {
    pub fn from_result(result: Result<Value, AdapterError>) -> Self {
        match result {
            Ok(payload) => AdapterResponse::Success { payload },
            Err(err) => AdapterResponse::Error {
                error: AdapterErrorBody {
                    category: err.category().to_string(),
                    message: err.to_string(),
                    error_type: err.error_type().to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RangeRequest {
    start_date: Option<String>,
    end_date: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct TransactionsRequest {
    #[serde(default)]
    start_date: Option<String>,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    subcategory: Option<String>,
    #[serde(default)]
    categories: Vec<CategoryFilter>,
    #[serde(default)]
    min_confidence: Option<f64>,
    #[serde(default = "default_true")]
    include_excluded: bool,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

impl TransactionsRequest {
    fn into_query(self) -> Result<TransactionQuery, LedgerError> {
        let start = parse_optional_timestamp(self.start_date.as_deref(), "start_date")?;
        let end = parse_optional_timestamp(self.end_date.as_deref(), "end_date")?;
        Interval::new(start, end).validate()?;
        if let Some(min_confidence) = self.min_confidence {
            if !(0.0..=1.0).contains(&min_confidence) {
                return Err(LedgerError::Validation(
                    "min_confidence 必须在 0 到 1 之间".to_string(),
                ));
            }
        }
        if self.limit.is_some_and(|l| l <= 0) {
            return Err(LedgerError::Validation("limit 必须大于 0".to_string()));
        }
        if self.offset.is_some_and(|o| o < 0) {
            return Err(LedgerError::Validation("offset 不能为负数".to_string()));
        }
        Ok(TransactionQuery {
            start,
            end,
            category: self.category,
            subcategory: self.subcategory,
            categories: self.categories,
            min_confidence: self.min_confidence,
            include_excluded: self.include_excluded,
            limit: self.limit,
            offset: self.offset,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToggleExcludeRequest {
    id: String,
    excluded: bool,
}

#[derive(Debug, Deserialize)]
struct ManualTransactionRequest {
    date: String,
    amount: String,
    #[serde(default)]
    currency: Option<String>,
    merchant: String,
    primary_category: String,
    #[serde(default)]
    subcategory: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct DeleteRuleRequest {
    merchant: String,
}

fn parse_query<T: DeserializeOwned>(query: Value, endpoint: &str) -> Result<T, AdapterError> {
    let query = if query.is_null() { json!({}) } else { query };
    serde_json::from_value(query).map_err(|e| {
        let msg = e.to_string();
        match msg.strip_prefix("missing field `") {
            Some(rest) => AdapterError::Ledger(LedgerError::Validation(format!(
                "{} 必填",
                rest.split('`').next().unwrap_or(rest)
            ))),
            None => AdapterError::Protocol(format!("request.query invalid for {endpoint}: {msg}")),
        }
    })
}

fn to_payload<T: Serialize>(value: &T) -> Result<Value, AdapterError> {
    serde_json::to_value(value)
        .map_err(|e| AdapterError::Protocol(format!("serialize payload failed: {e}")))
}

/// Accepts `sync`, `/sync` and `/api/sync` alike.
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_matches('/');
    trimmed
        .strip_prefix("api/")
        .unwrap_or(trimmed)
        .to_string()
}

struct Paths {
    db_path: PathBuf,
    mail_dir: PathBuf,
    rules_dir: PathBuf,
}

fn resolve_paths(dataset: Option<AdapterDataset>, config: &LedgerConfig) -> Paths {
    let dataset = dataset.unwrap_or_default();
    let pick = |value: Option<String>, fallback: &PathBuf| {
        value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| fallback.clone())
    };
    Paths {
        db_path: pick(dataset.db_path, &config.db_path),
        mail_dir: pick(dataset.mail_dir, &config.mail_dir),
        rules_dir: pick(dataset.rules_dir, &config.rules_dir),
    }
}

fn build_sync(
    config: &LedgerConfig,
    paths: &Paths,
) -> Result<TransactionSync<EmlDirSource, CachedClassifier<RuleClassifier>>, AdapterError> {
    let rules = RuleClassifier::from_store(&RulesStore::new(&paths.rules_dir))?;
    Ok(TransactionSync::new(
        EmlDirSource::new(&paths.mail_dir),
        CachedClassifier::new(rules, &config.cache),
        SyncRangeReconciler::new(config.limits),
        AlertQuery::new(&config.alert_sender, &config.alert_subject),
    ))
}

pub fn dispatch(
    req: AdapterRequest,
    config: &LedgerConfig,
    now: NaiveDateTime,
) -> Result<Value, AdapterError> {
    if req.schema_version != SCHEMA_VERSION {
        return Err(AdapterError::Protocol(format!(
            "unsupported schema_version: {}",
            req.schema_version
        )));
    }
    let path = req
        .endpoint
        .path
        .as_deref()
        .map(normalize_path)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AdapterError::Protocol("request.endpoint.path missing".to_string()))?;
    let paths = resolve_paths(req.dataset, config);
    tracing::debug!(endpoint = %path, db = %paths.db_path.display(), "dispatching adapter request");

    match path.as_str() {
        "sync" => {
            let range: RangeRequest = parse_query(req.query, &path)?;
            let start = parse_optional_timestamp(range.start_date.as_deref(), "start_date")?;
            let end = parse_optional_timestamp(range.end_date.as_deref(), "end_date")?;
            let sync = build_sync(config, &paths)?;
            let mut conn = open_and_migrate(&paths.db_path)?;
            let report = match (start, end) {
                (None, None) => sync.refresh_if_stale(&mut conn, now)?,
                _ => Some(sync.sync_range(&mut conn, &Interval::new(start, end), now)?),
            };
            Ok(json!({ "report": to_payload(&report)? }))
        }
        "transactions" => {
            let query = parse_query::<TransactionsRequest>(req.query, &path)?.into_query()?;
            let sync = build_sync(config, &paths)?;
            let mut conn = open_and_migrate(&paths.db_path)?;
            to_payload(&sync.transactions(&mut conn, &query, now)?)
        }
        "transactions/count" => {
            let query = parse_query::<TransactionsRequest>(req.query, &path)?.into_query()?;
            let conn = open_and_migrate(&paths.db_path)?;
            Ok(json!({ "count": count_transactions(&conn, &query)? }))
        }
        "transactions/toggle-exclude" => {
            let toggle: ToggleExcludeRequest = parse_query(req.query, &path)?;
            let conn = open_and_migrate(&paths.db_path)?;
            to_payload(&set_transaction_exclusion(&conn, toggle.id.trim(), toggle.excluded)?)
        }
        "transactions/manual" => {
            let manual: ManualTransactionRequest = parse_query(req.query, &path)?;
            let conn = open_and_migrate(&paths.db_path)?;
            let txn = add_manual_transaction(
                &conn,
                &ManualTransaction {
                    occurred_at: parse_timestamp(&manual.date, "date")?,
                    amount_cents: parse_amount_text_to_cents(&manual.amount)?,
                    currency: manual.currency,
                    merchant: manual.merchant,
                    primary_category: manual.primary_category,
                    subcategory: manual.subcategory,
                    description: manual.description,
                },
            )?;
            to_payload(&txn)
        }
        "coverage" => {
            let conn = open_and_migrate(&paths.db_path)?;
            let coverage = load_coverage(&conn)?;
            Ok(json!({
                "coverage": to_payload(&coverage)?,
                "should_sync": SyncRangeReconciler::new(config.limits)
                    .should_sync(coverage.as_ref(), None, now)
                    .map_err(LedgerError::from)?,
                "now": format_timestamp(&now),
            }))
        }
        "rules" => {
            let rules = RulesStore::new(&paths.rules_dir).list_rules()?;
            Ok(json!({ "rules": to_payload(&rules)? }))
        }
        "rules/add" => {
            let rule: SpecialRule = parse_query(req.query, &path)?;
            let added = RulesStore::new(&paths.rules_dir).add_rule(&rule)?;
            Ok(json!({ "rule": to_payload(&added)?, "success": true }))
        }
        "rules/update" => {
            let rule: SpecialRule = parse_query(req.query, &path)?;
            let updated = RulesStore::new(&paths.rules_dir).update_rule(&rule)?;
            Ok(json!({ "rule": to_payload(&updated)?, "success": true }))
        }
        "rules/delete" => {
            let target: DeleteRuleRequest = parse_query(req.query, &path)?;
            RulesStore::new(&paths.rules_dir).delete_rule(&target.merchant)?;
            Ok(json!({ "merchant": target.merchant.trim(), "success": true }))
        }
        "db/status" => to_payload(&inspect_status_at_path(&paths.db_path)?),
        other => Err(AdapterError::UnsupportedEndpoint(other.to_string())),
    }
}
