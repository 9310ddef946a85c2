use csv::{ReaderBuilder, WriterBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{LedgerError, LedgerResult};

pub const SPECIAL_RULES_FILE: &str = "special_rules.csv";
pub const CATEGORY_RULES_FILE: &str = "category_rules.csv";

const SPECIAL_RULE_HEADERS: &[&str] = &["merchant", "category", "subcategory"];
const CATEGORY_RULE_HEADERS: &[&str] = &[
    "priority",
    "match_type",
    "pattern",
    "primary_category",
    "subcategory",
    "confidence",
];
pub const RULE_MATCH_TYPES: &[&str] = &["exact", "contains", "prefix", "regex"];

/// A merchant pinned to a category regardless of keyword rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialRule {
    pub merchant: String,
    pub category: String,
    pub subcategory: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeywordRule {
    pub priority: i64,
    pub match_type: String,
    pub pattern: String,
    pub primary_category: String,
    pub subcategory: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct RulesStore {
    dir: PathBuf,
}

fn ensure_csv_file_with_headers(path: &Path, headers: &[&str]) -> LedgerResult<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    writer.write_record(headers)?;
    writer.flush()?;
    Ok(())
}

fn read_csv_rows(path: &Path, headers: &[&str]) -> LedgerResult<Vec<BTreeMap<String, String>>> {
    let mut rows = Vec::<BTreeMap<String, String>>::new();
    let mut reader = ReaderBuilder::new().flexible(true).from_path(path)?;
    for rec in reader.records() {
        let record = rec?;
        let mut row = BTreeMap::<String, String>::new();
        let mut has_any = false;
        for (idx, key) in headers.iter().enumerate() {
            let val = record.get(idx).unwrap_or_default().trim().to_string();
            if !val.is_empty() {
                has_any = true;
            }
            row.insert((*key).to_string(), val);
        }
        if has_any {
            rows.push(row);
        }
    }
    Ok(rows)
}

fn write_csv_rows(
    path: &Path,
    headers: &[&str],
    rows: &[BTreeMap<String, String>],
) -> LedgerResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = WriterBuilder::new().has_headers(true).from_path(path)?;
    writer.write_record(headers)?;
    for row in rows {
        let record = headers
            .iter()
            .map(|h| row.get(*h).cloned().unwrap_or_default())
            .collect::<Vec<_>>();
        writer.write_record(record)?;
    }
    writer.flush()?;
    Ok(())
}

fn required_text(raw: &str, field_name: &str) -> LedgerResult<String> {
    let text = raw.trim().to_string();
    if text.is_empty() {
        return Err(LedgerError::Validation(format!("{field_name} 必填")));
    }
    Ok(text)
}

fn same_merchant(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl RulesStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn special_rules_path(&self) -> LedgerResult<PathBuf> {
        let path = self.dir.join(SPECIAL_RULES_FILE);
        ensure_csv_file_with_headers(&path, SPECIAL_RULE_HEADERS)?;
        Ok(path)
    }

    fn read_special_rows(&self) -> LedgerResult<(PathBuf, Vec<BTreeMap<String, String>>)> {
        let path = self.special_rules_path()?;
        let rows = read_csv_rows(&path, SPECIAL_RULE_HEADERS)?;
        Ok((path, rows))
    }

    pub fn list_rules(&self) -> LedgerResult<Vec<SpecialRule>> {
        let (_, rows) = self.read_special_rows()?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let merchant = row.get("merchant").cloned().unwrap_or_default();
                let category = row.get("category").cloned().unwrap_or_default();
                if merchant.is_empty() || category.is_empty() {
                    return None;
                }
                Some(SpecialRule {
                    merchant,
                    category,
                    subcategory: row.get("subcategory").cloned().unwrap_or_default(),
                })
            })
            .collect())
    }

    /// Adds a special rule; an existing rule for the same merchant is a conflict.
    pub fn add_rule(&self, rule: &SpecialRule) -> LedgerResult<SpecialRule> {
        let rule = normalize_rule(rule)?;
        let (path, mut rows) = self.read_special_rows()?;
        if rows
            .iter()
            .any(|r| same_merchant(r.get("merchant").map(String::as_str).unwrap_or(""), &rule.merchant))
        {
            return Err(LedgerError::Conflict(format!(
                "商户规则已存在: {}",
                rule.merchant
            )));
        }
        rows.push(rule_to_row(&rule));
        sort_special_rows(&mut rows);
        write_csv_rows(&path, SPECIAL_RULE_HEADERS, &rows)?;
        tracing::info!(merchant = %rule.merchant, category = %rule.category, "special rule added");
        Ok(rule)
    }

    pub fn update_rule(&self, rule: &SpecialRule) -> LedgerResult<SpecialRule> {
        let rule = normalize_rule(rule)?;
        let (path, mut rows) = self.read_special_rows()?;
        let Some(existing) = rows
            .iter_mut()
            .find(|r| same_merchant(r.get("merchant").map(String::as_str).unwrap_or(""), &rule.merchant))
        else {
            return Err(LedgerError::NotFound(format!(
                "未找到商户规则: {}",
                rule.merchant
            )));
        };
        *existing = rule_to_row(&rule);
        write_csv_rows(&path, SPECIAL_RULE_HEADERS, &rows)?;
        tracing::info!(merchant = %rule.merchant, category = %rule.category, "special rule updated");
        Ok(rule)
    }

    pub fn delete_rule(&self, merchant: &str) -> LedgerResult<()> {
        let merchant = required_text(merchant, "merchant")?;
        let (path, mut rows) = self.read_special_rows()?;
        let before = rows.len();
        rows.retain(|r| !same_merchant(r.get("merchant").map(String::as_str).unwrap_or(""), &merchant));
        if rows.len() == before {
            return Err(LedgerError::NotFound(format!("未找到商户规则: {merchant}")));
        }
        write_csv_rows(&path, SPECIAL_RULE_HEADERS, &rows)?;
        tracing::info!(merchant = %merchant, "special rule deleted");
        Ok(())
    }

    /// Keyword rules sorted by priority. Rows with an unknown match type, blank
    /// pattern or blank category are ignored.
    pub fn load_keyword_rules(&self) -> LedgerResult<Vec<KeywordRule>> {
        let path = self.dir.join(CATEGORY_RULES_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        let mut rdr = csv::Reader::from_path(&path)?;
        for row in rdr.deserialize::<HashMap<String, String>>().flatten() {
            let get = |key: &str| row.get(key).map(|s| s.trim().to_string()).unwrap_or_default();
            let match_type = {
                let v = get("match_type").to_lowercase();
                if v.is_empty() {
                    "contains".to_string()
                } else {
                    v
                }
            };
            let pattern = get("pattern");
            let primary_category = get("primary_category");
            if pattern.is_empty()
                || primary_category.is_empty()
                || !RULE_MATCH_TYPES.contains(&match_type.as_str())
            {
                continue;
            }
            out.push(KeywordRule {
                priority: get("priority").parse::<i64>().unwrap_or(999),
                match_type,
                pattern,
                primary_category,
                subcategory: get("subcategory"),
                confidence: get("confidence")
                    .parse::<f64>()
                    .unwrap_or(0.7)
                    .clamp(0.0, 1.0),
            });
        }
        out.sort_by_key(|r| r.priority);
        Ok(out)
    }
}

fn normalize_rule(rule: &SpecialRule) -> LedgerResult<SpecialRule> {
    Ok(SpecialRule {
        merchant: required_text(&rule.merchant, "merchant")?,
        category: required_text(&rule.category, "category")?,
        subcategory: rule.subcategory.trim().to_string(),
    })
}

fn rule_to_row(rule: &SpecialRule) -> BTreeMap<String, String> {
    let mut row = BTreeMap::new();
    row.insert("merchant".to_string(), rule.merchant.clone());
    row.insert("category".to_string(), rule.category.clone());
    row.insert("subcategory".to_string(), rule.subcategory.clone());
    row
}

fn sort_special_rows(rows: &mut [BTreeMap<String, String>]) {
    rows.sort_by_key(|r| r.get("merchant").cloned().unwrap_or_default().to_lowercase());
}
