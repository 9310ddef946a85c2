//! Persistence of the coverage singleton (`sync_info`, id `last_sync`).

use chrono::NaiveDateTime;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::LedgerResult;
use crate::sync_range::{CoverageRecord, Interval, SyncRangeReconciler};

pub const COVERAGE_RECORD_ID: &str = "last_sync";

pub trait CoverageStore {
    fn load(&self) -> LedgerResult<Option<CoverageRecord>>;
    fn persist(&self, record: &CoverageRecord) -> LedgerResult<()>;
}

pub struct SqliteCoverageStore<'c> {
    conn: &'c Connection,
}

impl<'c> SqliteCoverageStore<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }
}

impl CoverageStore for SqliteCoverageStore<'_> {
    fn load(&self) -> LedgerResult<Option<CoverageRecord>> {
        let record = self
            .conn
            .query_row(
                "SELECT last_sync_date, start_date, end_date FROM sync_info WHERE id = ?1",
                [COVERAGE_RECORD_ID],
                |row| {
                    Ok(CoverageRecord {
                        last_synced_at: row.get::<_, NaiveDateTime>(0)?,
                        covered: Interval::new(
                            row.get::<_, Option<NaiveDateTime>>(1)?,
                            row.get::<_, Option<NaiveDateTime>>(2)?,
                        ),
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn persist(&self, record: &CoverageRecord) -> LedgerResult<()> {
        self.conn.execute(
            r#"
            INSERT INTO sync_info(id, last_sync_date, start_date, end_date)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                last_sync_date=excluded.last_sync_date,
                start_date=excluded.start_date,
                end_date=excluded.end_date
            "#,
            params![
                COVERAGE_RECORD_ID,
                record.last_synced_at,
                record.covered.start,
                record.covered.end,
            ],
        )?;
        Ok(())
    }
}

/// Load, reconcile and persist against any store. Callers are responsible for
/// wrapping this in a storage transaction.
pub fn reconcile_with_store<S: CoverageStore>(
    store: &S,
    reconciler: &SyncRangeReconciler,
    requested: &Interval,
    now: NaiveDateTime,
) -> LedgerResult<CoverageRecord> {
    let existing = store.load()?;
    let next = reconciler.reconcile_after_fetch(existing.as_ref(), requested, now)?;
    store.persist(&next)?;
    tracing::debug!(
        previous = ?existing.map(|r| r.covered),
        covered = ?next.covered,
        "coverage reconciled"
    );
    Ok(next)
}

/// The read-modify-write of the coverage record inside one `BEGIN IMMEDIATE`
/// transaction, so concurrent syncs queue on the SQLite write lock instead of
/// overwriting each other's coverage.
pub fn reconcile_coverage(
    conn: &mut Connection,
    reconciler: &SyncRangeReconciler,
    requested: &Interval,
    now: NaiveDateTime,
) -> LedgerResult<CoverageRecord> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let next = reconcile_with_store(&SqliteCoverageStore::new(&tx), reconciler, requested, now)?;
    tx.commit()?;
    Ok(next)
}

pub fn load_coverage(conn: &Connection) -> LedgerResult<Option<CoverageRecord>> {
    SqliteCoverageStore::new(conn).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, SyncRangeError};
    use crate::ledger_db::{memory_ledger, open_and_migrate};
    use crate::sync_range::SyncLimits;
    use chrono::{NaiveDate, TimeDelta};

    fn jan(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid january date")
    }

    #[test]
    fn empty_ledger_has_no_coverage() {
        let conn = memory_ledger();
        assert_eq!(load_coverage(&conn).expect("load"), None);
    }

    #[test]
    fn persisted_record_round_trips_including_absent_bounds() {
        let conn = memory_ledger();
        let store = SqliteCoverageStore::new(&conn);
        let record = CoverageRecord {
            last_synced_at: jan(3),
            covered: Interval::new(Some(jan(1)), None),
        };
        store.persist(&record).expect("persist");
        assert_eq!(store.load().expect("load"), Some(record));

        let updated = CoverageRecord {
            last_synced_at: jan(4),
            covered: Interval::bounded(jan(1), jan(4)),
        };
        store.persist(&updated).expect("persist again");
        assert_eq!(store.load().expect("reload"), Some(updated));

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_info", [], |row| row.get(0))
            .expect("count");
        assert_eq!(rows, 1, "coverage must stay a singleton");
    }

    #[test]
    fn reconcile_creates_then_widens_coverage() {
        let mut conn = memory_ledger();
        let reconciler = SyncRangeReconciler::default();

        let first = reconcile_coverage(
            &mut conn,
            &reconciler,
            &Interval::bounded(jan(10), jan(20)),
            jan(20),
        )
        .expect("first reconcile");
        assert_eq!(first.covered, Interval::bounded(jan(10), jan(20)));

        let second = reconcile_coverage(
            &mut conn,
            &reconciler,
            &Interval::bounded(jan(1), jan(15)),
            jan(21),
        )
        .expect("second reconcile");
        assert_eq!(second.covered, Interval::bounded(jan(1), jan(20)));
        assert_eq!(load_coverage(&conn).expect("load"), Some(second));
    }

    #[test]
    fn rejected_request_leaves_coverage_untouched() {
        let mut conn = memory_ledger();
        let reconciler = SyncRangeReconciler::default();
        reconcile_coverage(
            &mut conn,
            &reconciler,
            &Interval::bounded(jan(10), jan(20)),
            jan(20),
        )
        .expect("seed");

        let err = reconcile_coverage(
            &mut conn,
            &reconciler,
            &Interval::bounded(jan(25), jan(21)),
            jan(25),
        )
        .expect_err("inverted interval");
        assert!(matches!(
            err,
            LedgerError::Sync(SyncRangeError::InvalidInterval { .. })
        ));
        let kept = load_coverage(&conn).expect("load").expect("record");
        assert_eq!(kept.last_synced_at, jan(20));
    }

    #[test]
    fn two_connections_see_each_others_reconciles() {
        let dir = tempfile::tempdir().expect("temp dir");
        let db_path = dir.path().join("ledger.db");
        let mut a = open_and_migrate(&db_path).expect("conn a");
        let mut b = open_and_migrate(&db_path).expect("conn b");
        let reconciler = SyncRangeReconciler::new(SyncLimits {
            max_sync_span: TimeDelta::days(90),
            min_overlap: TimeDelta::hours(1),
        });

        reconcile_coverage(&mut a, &reconciler, &Interval::bounded(jan(10), jan(20)), jan(20))
            .expect("a");
        let merged =
            reconcile_coverage(&mut b, &reconciler, &Interval::bounded(jan(1), jan(5)), jan(20))
                .expect("b");
        assert_eq!(merged.covered, Interval::bounded(jan(1), jan(20)));
    }
}
