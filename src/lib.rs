pub mod adapter;
pub mod alert_parser;
pub mod classifier;
pub mod config;
pub mod coverage_store;
pub mod error;
pub mod ledger_db;
pub mod logging;
pub mod mail_source;
pub mod rules_store;
pub mod summary;
pub mod sync_range;
pub mod timestamps;
pub mod transaction_store;
pub mod transaction_sync;

pub use adapter::{dispatch, AdapterError, AdapterRequest, AdapterResponse};
pub use classifier::{CachedClassifier, MerchantCategory, MerchantClassifier, RuleClassifier};
pub use config::{LedgerConfig, LogFormat};
pub use coverage_store::{reconcile_coverage, CoverageStore, SqliteCoverageStore};
pub use error::{LedgerError, LedgerResult, SyncRangeError};
pub use mail_source::{AlertQuery, EmlDirSource, MailSource, RawEmail};
pub use sync_range::{CoverageRecord, Gaps, Interval, SyncLimits, SyncRangeReconciler};
pub use transaction_store::{Transaction, TransactionQuery};
pub use transaction_sync::{SyncReport, TransactionList, TransactionSync};
