//! Pulls card alerts for the parts of a requested range the ledger has not
//! seen yet, stores them as transactions and widens coverage afterwards.

use chrono::NaiveDateTime;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::alert_parser::parse_alert;
use crate::classifier::MerchantClassifier;
use crate::coverage_store::{load_coverage, reconcile_coverage};
use crate::error::LedgerResult;
use crate::mail_source::{AlertQuery, MailSource, RawEmail};
use crate::summary::{summarize, TransactionSummary};
use crate::sync_range::{CoverageRecord, Interval, SyncRangeReconciler};
use crate::timestamps::format_timestamp;
use crate::transaction_store::{
    count_transactions, insert_transaction, list_categories, query_all_transactions,
    query_transactions, Transaction, TransactionQuery,
};

pub const RUN_STATUS_RUNNING: &str = "running";
pub const RUN_STATUS_SUCCESS: &str = "success";
pub const RUN_STATUS_UP_TO_DATE: &str = "up_to_date";
pub const RUN_STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncReport {
    pub run_id: String,
    pub requested: Interval,
    pub gaps: Vec<Interval>,
    pub fetched_count: usize,
    pub imported_count: usize,
    pub duplicate_count: usize,
    /// Emails that were not recognisable alerts.
    pub skipped_count: usize,
    /// Alerts that parsed but could not be classified or stored.
    pub failed_count: usize,
    pub coverage: Option<CoverageRecord>,
    pub status: String,
}

impl SyncReport {
    fn new(run_id: String, requested: Interval) -> Self {
        Self {
            run_id,
            requested,
            gaps: Vec::new(),
            fetched_count: 0,
            imported_count: 0,
            duplicate_count: 0,
            skipped_count: 0,
            failed_count: 0,
            coverage: None,
            status: RUN_STATUS_RUNNING.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionList {
    pub transactions: Vec<Transaction>,
    pub total_count: i64,
    pub summary: TransactionSummary,
    pub categories: BTreeMap<String, Vec<String>>,
    pub sync: Option<SyncReport>,
}

pub struct TransactionSync<M, C> {
    mail: M,
    classifier: C,
    reconciler: SyncRangeReconciler,
    query_template: AlertQuery,
}

impl<M: MailSource, C: MerchantClassifier> TransactionSync<M, C> {
    pub fn new(
        mail: M,
        classifier: C,
        reconciler: SyncRangeReconciler,
        query_template: AlertQuery,
    ) -> Self {
        Self {
            mail,
            classifier,
            reconciler,
            query_template,
        }
    }

    /// Fetches every gap of `requested`, then folds `requested` into coverage.
    /// A failed fetch aborts the run and leaves coverage as it was.
    pub fn sync_range(
        &self,
        conn: &mut Connection,
        requested: &Interval,
        now: NaiveDateTime,
    ) -> LedgerResult<SyncReport> {
        let (req_start, req_end) = requested.require_bounded()?;
        let coverage = load_coverage(conn)?;
        let gaps = self.reconciler.compute_gaps(coverage.as_ref(), requested)?;

        let mut report = SyncReport::new(Uuid::new_v4().to_string(), *requested);
        report.gaps = gaps.collect();
        start_run(conn, &report.run_id, req_start, req_end, report.gaps.len(), now)?;

        if report.gaps.is_empty() {
            report.status = RUN_STATUS_UP_TO_DATE.to_string();
            report.coverage = coverage;
            finish_run(conn, &report, None, now)?;
            tracing::debug!(run_id = %report.run_id, "requested range already covered");
            return Ok(report);
        }

        for gap in report.gaps.clone() {
            let query = self.query_template.with_window(gap);
            let emails = match self.mail.fetch(&query) {
                Ok(emails) => emails,
                Err(err) => {
                    report.status = RUN_STATUS_FAILED.to_string();
                    tracing::error!(
                        run_id = %report.run_id,
                        query = %query.to_search_string(),
                        error = %err,
                        "mail fetch failed; coverage left unchanged"
                    );
                    finish_run(conn, &report, Some(&err.to_string()), now)?;
                    return Err(err);
                }
            };
            report.fetched_count += emails.len();
            self.import_emails(conn, &emails, &mut report)?;
        }

        let next = reconcile_coverage(conn, &self.reconciler, requested, now)?;
        report.coverage = Some(next);
        report.status = RUN_STATUS_SUCCESS.to_string();
        finish_run(conn, &report, None, now)?;
        tracing::info!(
            run_id = %report.run_id,
            gaps = report.gaps.len(),
            fetched = report.fetched_count,
            imported = report.imported_count,
            duplicates = report.duplicate_count,
            skipped = report.skipped_count,
            failed = report.failed_count,
            "sync finished"
        );
        Ok(report)
    }

    fn import_emails(
        &self,
        conn: &mut Connection,
        emails: &[RawEmail],
        report: &mut SyncReport,
    ) -> LedgerResult<()> {
        let tx = conn.transaction()?;
        for email in emails {
            let Some(alert) = parse_alert(email) else {
                report.skipped_count += 1;
                continue;
            };
            let category = match self.classifier.classify(&alert.merchant) {
                Ok(category) => category,
                Err(err) => {
                    report.failed_count += 1;
                    tracing::warn!(
                        message_id = %email.message_id,
                        merchant = %alert.merchant,
                        error = %err,
                        "classification failed"
                    );
                    continue;
                }
            };
            let txn = Transaction::from_alert(&alert, &category, &email.message_id);
            match insert_transaction(&tx, &txn) {
                Ok(true) => report.imported_count += 1,
                Ok(false) => report.duplicate_count += 1,
                Err(err) => {
                    report.failed_count += 1;
                    tracing::warn!(message_id = %email.message_id, error = %err, "failed to store transaction");
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Syncs the most recent `max_sync_span` once per calendar day.
    pub fn refresh_if_stale(
        &self,
        conn: &mut Connection,
        now: NaiveDateTime,
    ) -> LedgerResult<Option<SyncReport>> {
        let coverage = load_coverage(conn)?;
        if !self.reconciler.should_sync(coverage.as_ref(), None, now)? {
            return Ok(None);
        }
        let (start, end) = self.reconciler.apply_limits(Some(self.window_floor(now)), Some(now));
        let window = Interval::new(start, end);
        self.sync_range(conn, &window, now).map(Some)
    }

    fn window_floor(&self, now: NaiveDateTime) -> NaiveDateTime {
        now.checked_sub_signed(self.reconciler.limits().max_sync_span)
            .unwrap_or(NaiveDateTime::MIN)
    }

    /// Syncs whatever part of the query's range is missing, then reads the ledger.
    /// Without both bounds the daily refresh applies instead.
    pub fn transactions(
        &self,
        conn: &mut Connection,
        query: &TransactionQuery,
        now: NaiveDateTime,
    ) -> LedgerResult<TransactionList> {
        let requested = Interval::new(query.start, query.end);
        let sync = if requested.is_bounded() {
            let coverage = load_coverage(conn)?;
            if self
                .reconciler
                .should_sync(coverage.as_ref(), Some(&requested), now)?
            {
                Some(self.sync_range(conn, &requested, now)?)
            } else {
                None
            }
        } else {
            requested.validate()?;
            self.refresh_if_stale(conn, now)?
        };

        let transactions = query_transactions(conn, query)?;
        let total_count = count_transactions(conn, query)?;
        let summary_rows = query_all_transactions(conn, query)?;
        Ok(TransactionList {
            transactions,
            total_count,
            summary: summarize(&summary_rows),
            categories: list_categories(conn, query)?,
            sync,
        })
    }
}

fn start_run(
    conn: &Connection,
    run_id: &str,
    start: NaiveDateTime,
    end: NaiveDateTime,
    gap_count: usize,
    now: NaiveDateTime,
) -> LedgerResult<()> {
    conn.execute(
        r#"
        INSERT INTO sync_runs(id, requested_start, requested_end, gap_count, status, started_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
        params![
            run_id,
            format_timestamp(&start),
            format_timestamp(&end),
            gap_count as i64,
            RUN_STATUS_RUNNING,
            format_timestamp(&now),
        ],
    )?;
    Ok(())
}

fn finish_run(
    conn: &Connection,
    report: &SyncReport,
    error_message: Option<&str>,
    now: NaiveDateTime,
) -> LedgerResult<()> {
    conn.execute(
        r#"
        UPDATE sync_runs
        SET fetched_count = ?1,
            imported_count = ?2,
            skipped_count = ?3,
            failed_count = ?4,
            status = ?5,
            error_message = ?6,
            finished_at = ?7
        WHERE id = ?8
        "#,
        params![
            report.fetched_count as i64,
            report.imported_count as i64,
            (report.skipped_count + report.duplicate_count) as i64,
            report.failed_count as i64,
            report.status,
            error_message,
            format_timestamp(&now),
            report.run_id,
        ],
    )?;
    Ok(())
}
