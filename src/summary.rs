use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::transaction_store::Transaction;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategorySummary {
    pub total_cents: i64,
    pub count: i64,
    pub average_cents: i64,
    /// In first-seen order.
    pub merchants: Vec<String>,
}

impl CategorySummary {
    fn add(&mut self, txn: &Transaction) {
        self.total_cents += txn.amount_cents;
        self.count += 1;
        self.average_cents = average_cents(self.total_cents, self.count);
        if !self.merchants.iter().any(|m| m == &txn.merchant) {
            self.merchants.push(txn.merchant.clone());
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionSummary {
    pub total_spending_cents: i64,
    pub transaction_count: i64,
    pub average_transaction_cents: i64,
    pub by_primary_category: BTreeMap<String, CategorySummary>,
    /// Keyed `"<primary> - <sub>"`.
    pub by_subcategory: BTreeMap<String, CategorySummary>,
    pub merchants: Vec<String>,
}

fn average_cents(total_cents: i64, count: i64) -> i64 {
    if count == 0 {
        return 0;
    }
    (total_cents as f64 / count as f64).round() as i64
}

pub fn subcategory_key(primary: &str, sub: &str) -> String {
    format!("{primary} - {sub}")
}

/// Aggregates spending; excluded transactions do not count.
pub fn summarize(transactions: &[Transaction]) -> TransactionSummary {
    let mut summary = TransactionSummary::default();
    let mut merchants = BTreeSet::new();
    for txn in transactions.iter().filter(|t| !t.excluded) {
        summary.total_spending_cents += txn.amount_cents;
        summary.transaction_count += 1;
        summary
            .by_primary_category
            .entry(txn.primary_category.clone())
            .or_default()
            .add(txn);
        summary
            .by_subcategory
            .entry(subcategory_key(&txn.primary_category, &txn.subcategory))
            .or_default()
            .add(txn);
        merchants.insert(txn.merchant.clone());
    }
    summary.average_transaction_cents =
        average_cents(summary.total_spending_cents, summary.transaction_count);
    summary.merchants = merchants.into_iter().collect();
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn txn(amount_cents: i64, merchant: &str, primary: &str, sub: &str, excluded: bool) -> Transaction {
        Transaction {
            id: format!("{merchant}-{amount_cents}"),
            occurred_at: NaiveDate::from_ymd_opt(2024, 1, 1)
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .expect("ts"),
            amount_cents,
            currency: "JMD".to_string(),
            merchant: merchant.to_string(),
            primary_category: primary.to_string(),
            subcategory: sub.to_string(),
            confidence: 1.0,
            description: String::new(),
            source: "manual".to_string(),
            source_message_id: None,
            excluded,
        }
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(summarize(&[]), TransactionSummary::default());
    }

    #[test]
    fn aggregates_by_category_and_skips_excluded() {
        let rows = vec![
            txn(1_000, "HI-LO", "Food & Dining", "Groceries", false),
            txn(2_001, "PRICESMART", "Food & Dining", "Groceries", false),
            txn(500, "HI-LO", "Food & Dining", "Groceries", false),
            txn(4_000, "TOTAL", "Transportation", "Fuel", false),
            txn(99_999, "CASINO", "Entertainment", "Gaming", true),
        ];
        let summary = summarize(&rows);
        assert_eq!(summary.total_spending_cents, 7_501);
        assert_eq!(summary.transaction_count, 4);
        assert_eq!(summary.average_transaction_cents, 1_875);
        assert_eq!(summary.merchants, vec!["HI-LO", "PRICESMART", "TOTAL"]);
        assert!(!summary.by_primary_category.contains_key("Entertainment"));

        let food = &summary.by_primary_category["Food & Dining"];
        assert_eq!(food.count, 3);
        assert_eq!(food.total_cents, 3_501);
        assert_eq!(food.average_cents, 1_167);
        assert_eq!(food.merchants, vec!["HI-LO", "PRICESMART"]);
        assert_eq!(
            summary.by_subcategory["Transportation - Fuel"].total_cents,
            4_000
        );
    }
}
