use chrono::NaiveDateTime;
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, BTreeSet};

use crate::alert_parser::{ParsedAlert, DEFAULT_CURRENCY};
use crate::classifier::MerchantCategory;
use crate::error::{LedgerError, LedgerResult};
use crate::timestamps::format_timestamp;

pub const DEFAULT_QUERY_LIMIT: i64 = 100;
pub const MAX_QUERY_LIMIT: i64 = 1000;
pub const SOURCE_MAIL: &str = "mail";
pub const SOURCE_MANUAL: &str = "manual";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transaction {
    pub id: String,
    pub occurred_at: NaiveDateTime,
    pub amount_cents: i64,
    pub currency: String,
    pub merchant: String,
    pub primary_category: String,
    pub subcategory: String,
    pub confidence: f64,
    pub description: String,
    pub source: String,
    pub source_message_id: Option<String>,
    pub excluded: bool,
}

impl Transaction {
    pub fn from_alert(alert: &ParsedAlert, category: &MerchantCategory, message_id: &str) -> Self {
        Self {
            id: transaction_fingerprint(&alert.occurred_at, alert.amount_cents, &alert.merchant),
            occurred_at: alert.occurred_at,
            amount_cents: alert.amount_cents,
            currency: alert.currency.clone(),
            merchant: alert.merchant.clone(),
            primary_category: category.primary_category.clone(),
            subcategory: category.subcategory.clone(),
            confidence: category.confidence.clamp(0.0, 1.0),
            description: category.description.clone(),
            source: SOURCE_MAIL.to_string(),
            source_message_id: Some(message_id.to_string()).filter(|s| !s.is_empty()),
            excluded: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CategoryFilter {
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionQuery {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub categories: Vec<CategoryFilter>,
    pub min_confidence: Option<f64>,
    pub include_excluded: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TransactionQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

/// A transaction typed in by the user rather than parsed from an alert.
#[derive(Debug, Clone, PartialEq)]
pub struct ManualTransaction {
    pub occurred_at: NaiveDateTime,
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub merchant: String,
    pub primary_category: String,
    pub subcategory: String,
    pub description: String,
}

/// Same date, amount and merchant means the same transaction.
pub fn transaction_fingerprint(occurred_at: &NaiveDateTime, amount_cents: i64, merchant: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(
        [
            format_timestamp(occurred_at),
            amount_cents.to_string(),
            merchant.trim().to_string(),
        ]
        .join("|")
        .as_bytes(),
    );
    format!("txn_{:x}", hasher.finalize())
}

/// Returns whether a new row was written; a duplicate fingerprint is a no-op.
pub fn insert_transaction(conn: &Connection, txn: &Transaction) -> LedgerResult<bool> {
    let changed = conn.execute(
        r#"
        INSERT INTO transactions(
            id, occurred_at, amount_cents, currency, merchant, primary_category,
            subcategory, confidence, description, source, source_message_id, excluded
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
        ON CONFLICT(id) DO NOTHING
        "#,
        params![
            txn.id,
            format_timestamp(&txn.occurred_at),
            txn.amount_cents,
            txn.currency,
            txn.merchant,
            txn.primary_category,
            txn.subcategory,
            txn.confidence,
            txn.description,
            txn.source,
            txn.source_message_id,
            i64::from(txn.excluded),
        ],
    )?;
    Ok(changed > 0)
}

const TRANSACTION_COLUMNS: &str = "id, occurred_at, amount_cents, currency, merchant, primary_category, \
     subcategory, confidence, description, source, source_message_id, excluded";

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    Ok(Transaction {
        id: row.get(0)?,
        occurred_at: row.get(1)?,
        amount_cents: row.get(2)?,
        currency: row.get(3)?,
        merchant: row.get(4)?,
        primary_category: row.get(5)?,
        subcategory: row.get(6)?,
        confidence: row.get(7)?,
        description: row.get(8)?,
        source: row.get(9)?,
        source_message_id: row.get(10)?,
        excluded: row.get::<_, i64>(11)? != 0,
    })
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_lowercase)
}

fn build_where(query: &TransactionQuery) -> (String, Vec<SqlValue>) {
    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<SqlValue> = Vec::new();
    if let Some(start) = &query.start {
        conditions.push("occurred_at >= ?".to_string());
        params.push(SqlValue::Text(format_timestamp(start)));
    }
    if let Some(end) = &query.end {
        conditions.push("occurred_at <= ?".to_string());
        params.push(SqlValue::Text(format_timestamp(end)));
    }
    if let Some(category) = non_blank(&query.category) {
        conditions.push("instr(lower(primary_category), ?) > 0".to_string());
        params.push(SqlValue::Text(category));
    }
    if let Some(subcategory) = non_blank(&query.subcategory) {
        conditions.push("instr(lower(subcategory), ?) > 0".to_string());
        params.push(SqlValue::Text(subcategory));
    }
    let mut alternatives: Vec<&str> = Vec::new();
    for filter in &query.categories {
        let category = filter.category.trim().to_lowercase();
        if category.is_empty() {
            continue;
        }
        match non_blank(&filter.subcategory) {
            Some(sub) => {
                alternatives.push("(lower(primary_category) = ? AND lower(subcategory) = ?)");
                params.push(SqlValue::Text(category));
                params.push(SqlValue::Text(sub));
            }
            None => {
                alternatives.push("lower(primary_category) = ?");
                params.push(SqlValue::Text(category));
            }
        }
    }
    if !alternatives.is_empty() {
        conditions.push(format!("({})", alternatives.join(" OR ")));
    }
    if let Some(min_confidence) = query.min_confidence.filter(|v| *v > 0.0) {
        conditions.push("confidence >= ?".to_string());
        params.push(SqlValue::Real(min_confidence));
    }
    if !query.include_excluded {
        conditions.push("excluded = 0".to_string());
    }
    let where_sql = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (where_sql, params)
}

fn select_transactions(
    conn: &Connection,
    query: &TransactionQuery,
    paged: bool,
) -> LedgerResult<Vec<Transaction>> {
    let (where_sql, mut params) = build_where(query);
    let page_sql = if paged {
        params.push(SqlValue::Integer(query.effective_limit()));
        params.push(SqlValue::Integer(query.effective_offset()));
        "LIMIT ? OFFSET ?"
    } else {
        ""
    };
    let sql = format!(
        r#"
        SELECT {TRANSACTION_COLUMNS}
        FROM transactions
        {where_sql}
        ORDER BY occurred_at DESC, id ASC
        {page_sql}
        "#
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), row_to_transaction)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}

/// One page of matching rows, newest first.
pub fn query_transactions(conn: &Connection, query: &TransactionQuery) -> LedgerResult<Vec<Transaction>> {
    select_transactions(conn, query, true)
}

/// Every matching row; `limit` / `offset` are ignored. Feeds summaries, which
/// must cover the whole range rather than one page.
pub fn query_all_transactions(
    conn: &Connection,
    query: &TransactionQuery,
) -> LedgerResult<Vec<Transaction>> {
    select_transactions(conn, query, false)
}

/// Matching rows regardless of `limit` / `offset`.
pub fn count_transactions(conn: &Connection, query: &TransactionQuery) -> LedgerResult<i64> {
    let (where_sql, params) = build_where(query);
    let sql = format!("SELECT COUNT(*) FROM transactions {where_sql}");
    let count = conn.query_row(&sql, params_from_iter(params.iter()), |row| row.get::<_, i64>(0))?;
    Ok(count)
}

/// Primary category to its sorted subcategories, over the date range of `query`.
/// Category filters are ignored so the caller can offer every option.
pub fn list_categories(
    conn: &Connection,
    query: &TransactionQuery,
) -> LedgerResult<BTreeMap<String, Vec<String>>> {
    let scope = TransactionQuery {
        start: query.start,
        end: query.end,
        include_excluded: query.include_excluded,
        ..TransactionQuery::default()
    };
    let (where_sql, params) = build_where(&scope);
    let sql = format!(
        "SELECT DISTINCT primary_category, subcategory FROM transactions {where_sql}"
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut grouped = BTreeMap::<String, BTreeSet<String>>::new();
    for row in rows {
        let (primary, sub) = row?;
        let subs = grouped.entry(primary).or_default();
        if !sub.is_empty() {
            subs.insert(sub);
        }
    }
    Ok(grouped
        .into_iter()
        .map(|(primary, subs)| (primary, subs.into_iter().collect()))
        .collect())
}

pub fn get_transaction(conn: &Connection, id: &str) -> LedgerResult<Option<Transaction>> {
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?1");
    Ok(conn.query_row(&sql, [id], row_to_transaction).optional()?)
}

pub fn set_transaction_exclusion(conn: &Connection, id: &str, excluded: bool) -> LedgerResult<Transaction> {
    let changed = conn.execute(
        "UPDATE transactions SET excluded = ?1, updated_at = datetime('now') WHERE id = ?2",
        params![i64::from(excluded), id],
    )?;
    if changed == 0 {
        return Err(LedgerError::NotFound(format!("未找到交易: {id}")));
    }
    tracing::info!(id, excluded, "transaction exclusion updated");
    get_transaction(conn, id)?
        .ok_or_else(|| LedgerError::NotFound(format!("未找到交易: {id}")))
}

pub fn add_manual_transaction(conn: &Connection, manual: &ManualTransaction) -> LedgerResult<Transaction> {
    let merchant = manual.merchant.trim().to_string();
    if merchant.is_empty() {
        return Err(LedgerError::Validation("merchant 必填".to_string()));
    }
    let primary_category = manual.primary_category.trim().to_string();
    if primary_category.is_empty() {
        return Err(LedgerError::Validation("primary_category 必填".to_string()));
    }
    let currency = manual
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_uppercase)
        .unwrap_or_else(|| DEFAULT_CURRENCY.to_string());

    let txn = Transaction {
        id: transaction_fingerprint(&manual.occurred_at, manual.amount_cents, &merchant),
        occurred_at: manual.occurred_at,
        amount_cents: manual.amount_cents,
        currency,
        merchant,
        primary_category,
        subcategory: manual.subcategory.trim().to_string(),
        confidence: 1.0,
        description: manual.description.trim().to_string(),
        source: SOURCE_MANUAL.to_string(),
        source_message_id: None,
        excluded: false,
    };
    if !insert_transaction(conn, &txn)? {
        return Err(LedgerError::Conflict(format!(
            "交易已存在: {} @ {}",
            txn.merchant,
            format_timestamp(&txn.occurred_at)
        )));
    }
    tracing::info!(id = %txn.id, merchant = %txn.merchant, "manual transaction added");
    Ok(txn)
}
