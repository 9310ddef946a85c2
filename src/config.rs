//! Runtime configuration, read from `ALERTLEDGER_*` environment variables (a
//! `.env` file in the working directory is honoured).

use chrono::TimeDelta;
use std::env;
use std::path::PathBuf;

use crate::error::{LedgerError, LedgerResult};
use crate::sync_range::{SyncLimits, DEFAULT_MAX_SYNC_SPAN_DAYS, DEFAULT_MIN_OVERLAP_HOURS};

const DEFAULT_DB_PATH: &str = "data/alertledger.db";
const DEFAULT_MAIL_DIR: &str = "data/mail";
const DEFAULT_RULES_DIR: &str = "data/rules";
pub const DEFAULT_ALERT_SENDER: &str = "no-reply-ncbcardalerts@jncb.com";
pub const DEFAULT_ALERT_SUBJECT: &str = "Transaction Approved";
const DEFAULT_CACHE_TTL_SECS: u64 = 86_400;
const DEFAULT_CACHE_MAX_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub db_path: PathBuf,
    pub mail_dir: PathBuf,
    pub rules_dir: PathBuf,
    pub alert_sender: String,
    pub alert_subject: String,
    pub limits: SyncLimits,
    pub cache: CacheConfig,
    pub log_level: String,
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub max_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            max_size: DEFAULT_CACHE_MAX_SIZE,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            mail_dir: PathBuf::from(DEFAULT_MAIL_DIR),
            rules_dir: PathBuf::from(DEFAULT_RULES_DIR),
            alert_sender: DEFAULT_ALERT_SENDER.to_string(),
            alert_subject: DEFAULT_ALERT_SUBJECT.to_string(),
            limits: SyncLimits::default(),
            cache: CacheConfig::default(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> LedgerResult<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> LedgerResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let max_span_days =
            parse_number::<i64>(text("ALERTLEDGER_MAX_SYNC_SPAN_DAYS"), "ALERTLEDGER_MAX_SYNC_SPAN_DAYS")?
                .unwrap_or(DEFAULT_MAX_SYNC_SPAN_DAYS);
        if max_span_days <= 0 {
            return Err(LedgerError::Config(
                "ALERTLEDGER_MAX_SYNC_SPAN_DAYS 必须大于 0".to_string(),
            ));
        }
        let max_sync_span = TimeDelta::try_days(max_span_days).ok_or_else(|| {
            LedgerError::Config(format!(
                "ALERTLEDGER_MAX_SYNC_SPAN_DAYS 超出范围: {max_span_days}"
            ))
        })?;
        let min_overlap_hours = parse_number::<i64>(
            text("ALERTLEDGER_MIN_OVERLAP_HOURS"),
            "ALERTLEDGER_MIN_OVERLAP_HOURS",
        )?
        .unwrap_or(DEFAULT_MIN_OVERLAP_HOURS);
        if min_overlap_hours < 0 {
            return Err(LedgerError::Config(
                "ALERTLEDGER_MIN_OVERLAP_HOURS 不能为负数".to_string(),
            ));
        }
        let min_overlap = TimeDelta::try_hours(min_overlap_hours).ok_or_else(|| {
            LedgerError::Config(format!(
                "ALERTLEDGER_MIN_OVERLAP_HOURS 超出范围: {min_overlap_hours}"
            ))
        })?;

        let log_format = match text("ALERTLEDGER_LOG_FORMAT")
            .map(|v| v.to_lowercase())
            .as_deref()
        {
            None | Some("pretty") | Some("text") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(LedgerError::Config(format!(
                    "ALERTLEDGER_LOG_FORMAT 仅支持 pretty/json: {other}"
                )))
            }
        };

        Ok(Self {
            db_path: text("ALERTLEDGER_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            mail_dir: text("ALERTLEDGER_MAIL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.mail_dir),
            rules_dir: text("ALERTLEDGER_RULES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.rules_dir),
            alert_sender: text("ALERTLEDGER_ALERT_SENDER").unwrap_or(defaults.alert_sender),
            alert_subject: text("ALERTLEDGER_ALERT_SUBJECT").unwrap_or(defaults.alert_subject),
            limits: SyncLimits {
                max_sync_span,
                min_overlap,
            },
            cache: CacheConfig {
                ttl_secs: parse_number(text("ALERTLEDGER_CACHE_TTL_SECS"), "ALERTLEDGER_CACHE_TTL_SECS")?
                    .unwrap_or(defaults.cache.ttl_secs),
                max_size: parse_number(
                    text("ALERTLEDGER_CACHE_MAX_SIZE"),
                    "ALERTLEDGER_CACHE_MAX_SIZE",
                )?
                .unwrap_or(defaults.cache.max_size),
            },
            log_level: text("ALERTLEDGER_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
        })
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, key: &str) -> LedgerResult<Option<T>> {
    match raw {
        None => Ok(None),
        Some(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|_| LedgerError::Config(format!("{key} 不是合法数字: {v}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = LedgerConfig::from_lookup(lookup_from(&[])).expect("defaults");
        assert_eq!(cfg.limits, SyncLimits::default());
        assert_eq!(cfg.alert_sender, DEFAULT_ALERT_SENDER);
        assert_eq!(cfg.cache.max_size, 1_000);
        assert_eq!(cfg.log_format, LogFormat::Pretty);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = LedgerConfig::from_lookup(lookup_from(&[
            ("ALERTLEDGER_MAX_SYNC_SPAN_DAYS", "10"),
            ("ALERTLEDGER_MIN_OVERLAP_HOURS", "6"),
            ("ALERTLEDGER_DB_PATH", "/tmp/x.db"),
            ("ALERTLEDGER_LOG_FORMAT", "JSON"),
        ]))
        .expect("overrides");
        assert_eq!(cfg.limits.max_sync_span, TimeDelta::days(10));
        assert_eq!(cfg.limits.min_overlap, TimeDelta::hours(6));
        assert_eq!(cfg.db_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for pairs in [
            [("ALERTLEDGER_MAX_SYNC_SPAN_DAYS", "ninety")],
            [("ALERTLEDGER_MAX_SYNC_SPAN_DAYS", "0")],
            [("ALERTLEDGER_MIN_OVERLAP_HOURS", "-1")],
            [("ALERTLEDGER_MAX_SYNC_SPAN_DAYS", "200000000000")],
            [("ALERTLEDGER_MIN_OVERLAP_HOURS", "9000000000000000")],
            [("ALERTLEDGER_LOG_FORMAT", "xml")],
        ] {
            let err = LedgerConfig::from_lookup(lookup_from(&pairs)).expect_err("should fail");
            assert!(matches!(err, LedgerError::Config(_)), "{pairs:?}: {err}");
        }
    }
}
