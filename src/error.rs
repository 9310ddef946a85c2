use chrono::NaiveDateTime;
use thiserror::Error;

/// Which side of an interval a bound belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Start => f.write_str("start"),
            Bound::End => f.write_str("end"),
        }
    }
}

/// Rejections raised by the sync-range reconciler before any computation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncRangeError {
    #[error("invalid interval: start {start} is after end {end}")]
    InvalidInterval {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },

    #[error("requested interval is missing its {0} bound")]
    MissingBound(Bound),
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Sync(#[from] SyncRangeError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("mail source error: {0}")]
    Mail(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("classification error: {0}")]
    Classification(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl LedgerError {
    /// Stable category name used by the adapter's error envelope.
    pub fn category(&self) -> &'static str {
        match self {
            LedgerError::Sync(SyncRangeError::InvalidInterval { .. }) => "INVALID_RANGE_ERROR",
            LedgerError::Sync(SyncRangeError::MissingBound(_)) | LedgerError::Validation(_) => {
                "VALIDATION_ERROR"
            }
            LedgerError::NotFound(_) => "NOT_FOUND_ERROR",
            LedgerError::Conflict(_) => "CONFLICT_ERROR",
            LedgerError::Config(_) => "CONFIG_ERROR",
            LedgerError::Mail(_) => "MAIL_SOURCE_ERROR",
            LedgerError::Classification(_) => "CLASSIFICATION_ERROR",
            LedgerError::Database(_) | LedgerError::Io(_) | LedgerError::Csv(_) => {
                "STORAGE_ERROR"
            }
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
