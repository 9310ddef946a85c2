//! Incremental sync-range reconciliation.
//!
//! The ledger remembers one coverage interval: the span of time already pulled
//! from the mail source. A request for some interval is answered by fetching only
//! the parts that fall outside coverage (the gaps), and coverage is widened
//! afterwards. Every interval the reconciler produces is bounded by
//! [`SyncLimits::max_sync_span`], trimming from the past so recent data survives.

use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::{Bound, SyncRangeError};

pub const DEFAULT_MAX_SYNC_SPAN_DAYS: i64 = 90;
pub const DEFAULT_MIN_OVERLAP_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interval {
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
}

impl Interval {
    pub fn new(start: Option<NaiveDateTime>, end: Option<NaiveDateTime>) -> Self {
        Self { start, end }
    }

    pub fn bounded(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() && self.end.is_some()
    }

    pub fn span(&self) -> Option<TimeDelta> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Rejects `start > end`. Absent bounds are allowed.
    pub fn validate(&self) -> Result<(), SyncRangeError> {
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(SyncRangeError::InvalidInterval { start, end });
            }
        }
        Ok(())
    }

    /// Both bounds present and ordered; the shape `compute_gaps` requires.
    pub fn require_bounded(&self) -> Result<(NaiveDateTime, NaiveDateTime), SyncRangeError> {
        let start = self.start.ok_or(SyncRangeError::MissingBound(Bound::Start))?;
        let end = self.end.ok_or(SyncRangeError::MissingBound(Bound::End))?;
        if start > end {
            return Err(SyncRangeError::InvalidInterval { start, end });
        }
        Ok((start, end))
    }
}

/// The persisted singleton describing what has already been synced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageRecord {
    pub last_synced_at: NaiveDateTime,
    pub covered: Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub max_sync_span: TimeDelta,
    pub min_overlap: TimeDelta,
}

impl Default for SyncLimits {
    fn default() -> Self {
        Self {
            max_sync_span: TimeDelta::days(DEFAULT_MAX_SYNC_SPAN_DAYS),
            min_overlap: TimeDelta::hours(DEFAULT_MIN_OVERLAP_HOURS),
        }
    }
}

/// Gaps returned by [`SyncRangeReconciler::compute_gaps`], leading gap first.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Gaps {
    leading: Option<Interval>,
    trailing: Option<Interval>,
}

impl Gaps {
    pub fn is_empty(&self) -> bool {
        self.leading.is_none() && self.trailing.is_none()
    }
}

impl Iterator for Gaps {
    type Item = Interval;

    fn next(&mut self) -> Option<Self::Item> {
        self.leading.take().or_else(|| self.trailing.take())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::from(self.leading.is_some()) + usize::from(self.trailing.is_some());
        (n, Some(n))
    }
}

impl ExactSizeIterator for Gaps {}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncRangeReconciler {
    limits: SyncLimits,
}

impl SyncRangeReconciler {
    pub fn new(limits: SyncLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> SyncLimits {
        self.limits
    }

    /// Truncates `start` so the interval spans at most `max_sync_span`. `end` is
    /// never moved.
    pub fn apply_limits(
        &self,
        start: Option<NaiveDateTime>,
        end: Option<NaiveDateTime>,
    ) -> (Option<NaiveDateTime>, Option<NaiveDateTime>) {
        let (Some(s), Some(e)) = (start, end) else {
            return (start, end);
        };
        if e - s > self.limits.max_sync_span {
            (Some(self.window_start(e)), end)
        } else {
            (start, end)
        }
    }

    fn apply_limits_to(&self, interval: Interval) -> Interval {
        let (start, end) = self.apply_limits(interval.start, interval.end);
        Interval { start, end }
    }

    fn window_start(&self, end: NaiveDateTime) -> NaiveDateTime {
        end.checked_sub_signed(self.limits.max_sync_span)
            .unwrap_or(NaiveDateTime::MIN)
    }

    pub fn compute_gaps(
        &self,
        coverage: Option<&CoverageRecord>,
        requested: &Interval,
    ) -> Result<Gaps, SyncRangeError> {
        let (req_start, req_end) = requested.require_bounded()?;

        let covered = coverage.map(|c| c.covered).unwrap_or_default();
        let (Some(cov_start), Some(cov_end)) = (covered.start, covered.end) else {
            return Ok(Gaps {
                leading: Some(self.apply_limits_to(*requested)),
                trailing: None,
            });
        };

        let leading = (req_start < cov_start)
            .then(|| self.apply_limits_to(Interval::bounded(req_start, cov_start.min(req_end))));
        let trailing = (req_end > cov_end)
            .then(|| self.apply_limits_to(Interval::bounded(cov_end.max(req_start), req_end)));

        Ok(Gaps { leading, trailing })
    }

    /// Folds a fetched interval into coverage. `now` becomes `last_synced_at`.
    pub fn reconcile_after_fetch(
        &self,
        existing: Option<&CoverageRecord>,
        requested: &Interval,
        now: NaiveDateTime,
    ) -> Result<CoverageRecord, SyncRangeError> {
        requested.validate()?;

        let Some(existing) = existing else {
            return Ok(CoverageRecord {
                last_synced_at: now,
                covered: self.apply_limits_to(*requested),
            });
        };
        let covered = existing.covered;

        let union_start = min_present(covered.start, requested.start);
        let union_end = max_present(covered.end, requested.end);
        let union = Interval::new(union_start, union_end);

        let exceeds_span = union
            .span()
            .is_some_and(|span| span > self.limits.max_sync_span);

        let next = if exceeds_span {
            // Sliding window anchored on the most recent edge the caller asked for.
            let new_end = requested.end.or(covered.end);
            let new_start = match (union_start, new_end) {
                (Some(u), Some(e)) => Some(u.max(self.window_start(e))),
                (start, _) => start,
            };
            Interval::new(new_start, new_end)
        } else {
            Interval::new(
                self.damp(union_start, covered.start, requested.start),
                self.damp(union_end, covered.end, requested.end),
            )
        };

        Ok(CoverageRecord {
            last_synced_at: now,
            covered: next,
        })
    }

    fn damp(
        &self,
        union_bound: Option<NaiveDateTime>,
        covered_bound: Option<NaiveDateTime>,
        requested_bound: Option<NaiveDateTime>,
    ) -> Option<NaiveDateTime> {
        match (covered_bound, requested_bound) {
            (Some(c), Some(r)) if (r - c).abs() < self.limits.min_overlap => Some(c),
            _ => union_bound,
        }
    }

    /// `None` asks the daily freshness question; `Some` asks whether any gap exists.
    pub fn should_sync(
        &self,
        coverage: Option<&CoverageRecord>,
        requested: Option<&Interval>,
        now: NaiveDateTime,
    ) -> Result<bool, SyncRangeError> {
        match requested {
            None => Ok(coverage
                .map(|c| c.last_synced_at.date() != now.date())
                .unwrap_or(true)),
            Some(requested) => Ok(!self.compute_gaps(coverage, requested)?.is_empty()),
        }
    }
}

fn min_present(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_present(a: Option<NaiveDateTime>, b: Option<NaiveDateTime>) -> Option<NaiveDateTime> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}
