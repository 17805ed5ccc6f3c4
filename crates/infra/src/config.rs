//! Configuration loading and representation.
//!
//! Everything is read from `LOTSYNC_*` environment variables (plus
//! `DATABASE_URL`). Unset keys take their defaults; set but malformed keys
//! are an error, never silently replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::projection::ProjectionConfig;
use crate::reconciliation::{CutPolicy, ReconcileConfig};
use crate::retry::{BackoffStrategy, RetryPolicy};
use crate::store::Shard;

pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DELTA_TIMEOUT_MS: &str = "LOTSYNC_DELTA_TIMEOUT_MS";
pub const CONFLICT_RETRIES: &str = "LOTSYNC_CONFLICT_RETRIES";
pub const CONFLICT_BACKOFF: &str = "LOTSYNC_CONFLICT_BACKOFF";
pub const CUT_POLICY: &str = "LOTSYNC_CUT_POLICY";
pub const POLL_INTERVAL_MS: &str = "LOTSYNC_POLL_INTERVAL_MS";
pub const POLL_BATCH: &str = "LOTSYNC_POLL_BATCH";
pub const WARNING_THRESHOLD: &str = "LOTSYNC_WARNING_THRESHOLD";
pub const DEFAULT_LEAD_DAYS: &str = "LOTSYNC_DEFAULT_LEAD_DAYS";
pub const SHARD: &str = "LOTSYNC_SHARD";
pub const LEDGER_RESYNC_MS: &str = "LOTSYNC_LEDGER_RESYNC_MS";

/// First delay between conflict retries. Not configurable.
const CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(25);
/// Cap for exponential conflict backoff.
const CONFLICT_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotsyncConfig {
    pub database_url: Option<String>,
    pub reconcile: ReconcileConfig,
    pub projection: ProjectionConfig,
}

impl LotsyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let mut reconcile = ReconcileConfig::default();
        if let Some(ms) = parse::<u64>(DELTA_TIMEOUT_MS, get(DELTA_TIMEOUT_MS))? {
            reconcile.delta_timeout = Duration::from_millis(ms);
        }
        let attempts = match parse::<u32>(CONFLICT_RETRIES, get(CONFLICT_RETRIES))? {
            // Retries on top of the first attempt.
            Some(retries) => retries.saturating_add(1),
            None => reconcile.retry.max_attempts,
        };
        let backoff = match get(CONFLICT_BACKOFF) {
            Some(raw) => raw
                .parse::<BackoffStrategy>()
                .map_err(|reason| invalid(CONFLICT_BACKOFF, &raw, reason))?,
            None => BackoffStrategy::Fixed,
        };
        reconcile.retry = match backoff {
            BackoffStrategy::Fixed => RetryPolicy::fixed(attempts, CONFLICT_RETRY_DELAY),
            BackoffStrategy::Exponential => {
                RetryPolicy::exponential(attempts, CONFLICT_RETRY_DELAY, CONFLICT_RETRY_MAX_DELAY)
            }
        };
        if let Some(policy) = get(CUT_POLICY) {
            reconcile.cut_policy = policy.parse::<CutPolicy>().map_err(|err| ConfigError::Invalid {
                key: CUT_POLICY,
                value: policy.clone(),
                reason: err.to_string(),
            })?;
        }

        let mut projection = ProjectionConfig::default();
        if let Some(ms) = parse::<u64>(POLL_INTERVAL_MS, get(POLL_INTERVAL_MS))? {
            if ms == 0 {
                return Err(invalid(POLL_INTERVAL_MS, "0", "must be positive"));
            }
            projection.poll_interval = Duration::from_millis(ms);
        }
        if let Some(batch) = parse::<usize>(POLL_BATCH, get(POLL_BATCH))? {
            if batch == 0 {
                return Err(invalid(POLL_BATCH, "0", "must be positive"));
            }
            projection.batch_limit = batch;
        }
        if let Some(threshold) = parse::<Decimal>(WARNING_THRESHOLD, get(WARNING_THRESHOLD))? {
            projection.warning_threshold = threshold;
        }
        if let Some(days) = parse::<u32>(DEFAULT_LEAD_DAYS, get(DEFAULT_LEAD_DAYS))? {
            projection.default_lead_time_days = days;
        }
        if let Some(raw) = get(SHARD) {
            projection.shard = Some(parse_shard(&raw)?);
        }
        if let Some(ms) = parse::<u64>(LEDGER_RESYNC_MS, get(LEDGER_RESYNC_MS))? {
            projection.ledger_resync_interval = Duration::from_millis(ms);
        }

        Ok(Self {
            database_url: get(DATABASE_URL),
            reconcile,
            projection,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url.as_deref().ok_or(ConfigError::Missing(DATABASE_URL))
    }
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn parse<T>(key: &'static str, raw: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    raw.map(|value| value.parse::<T>().map_err(|err| invalid(key, &value, err.to_string())))
        .transpose()
}

/// `index/count`, e.g. `0/4`.
fn parse_shard(raw: &str) -> Result<Shard, ConfigError> {
    let (index, count) = raw
        .split_once('/')
        .ok_or_else(|| invalid(SHARD, raw, "expected index/count"))?;
    let index = index
        .trim()
        .parse::<u32>()
        .map_err(|err| invalid(SHARD, raw, err.to_string()))?;
    let count = count
        .trim()
        .parse::<u32>()
        .map_err(|err| invalid(SHARD, raw, err.to_string()))?;
    Shard::new(index, count).map_err(|err| invalid(SHARD, raw, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<LotsyncConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        LotsyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.reconcile, ReconcileConfig::default());
        assert_eq!(cfg.projection, ProjectionConfig::default());
        assert_eq!(cfg.require_database_url(), Err(ConfigError::Missing(DATABASE_URL)));
    }

    #[test]
    fn values_are_read_and_typed() {
        let cfg = config(&[
            (DATABASE_URL, "postgres://localhost/lotsync"),
            (DELTA_TIMEOUT_MS, "1500"),
            (CONFLICT_RETRIES, "4"),
            (CUT_POLICY, "excess_only"),
            (POLL_INTERVAL_MS, "250"),
            (POLL_BATCH, "50"),
            (WARNING_THRESHOLD, "12.5"),
            (DEFAULT_LEAD_DAYS, "5"),
            (SHARD, "1/4"),
            (LEDGER_RESYNC_MS, "60000"),
        ])
        .unwrap();

        assert_eq!(cfg.require_database_url().unwrap(), "postgres://localhost/lotsync");
        assert_eq!(cfg.reconcile.delta_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.reconcile.retry.max_attempts, 5);
        assert_eq!(cfg.reconcile.cut_policy, CutPolicy::ExcessOnly);
        assert_eq!(cfg.projection.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.projection.batch_limit, 50);
        assert_eq!(cfg.projection.warning_threshold, Decimal::new(125, 1));
        assert_eq!(cfg.projection.default_lead_time_days, 5);
        assert_eq!(cfg.projection.shard, Some(Shard { index: 1, count: 4 }));
        assert_eq!(cfg.projection.ledger_resync_interval, Duration::from_secs(60));
        assert_eq!(cfg.reconcile.retry.strategy, BackoffStrategy::Fixed);
    }

    #[test]
    fn exponential_backoff_is_selectable() {
        let cfg = config(&[(CONFLICT_BACKOFF, "exponential"), (CONFLICT_RETRIES, "5")]).unwrap();
        let retry = &cfg.reconcile.retry;
        assert_eq!(retry.strategy, BackoffStrategy::Exponential);
        assert_eq!(retry.max_attempts, 6);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(25));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_secs(1));

        assert!(matches!(
            config(&[(CONFLICT_BACKOFF, "linear")]),
            Err(ConfigError::Invalid { key: CONFLICT_BACKOFF, .. })
        ));
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[(DELTA_TIMEOUT_MS, "  ")]).unwrap();
        assert_eq!(cfg.reconcile.delta_timeout, ReconcileConfig::default().delta_timeout);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            config(&[(DELTA_TIMEOUT_MS, "soon")]),
            Err(ConfigError::Invalid { key: DELTA_TIMEOUT_MS, .. })
        ));
        assert!(matches!(
            config(&[(CUT_POLICY, "half")]),
            Err(ConfigError::Invalid { key: CUT_POLICY, .. })
        ));
        assert!(matches!(config(&[(SHARD, "4/4")]), Err(ConfigError::Invalid { key: SHARD, .. })));
        assert!(matches!(config(&[(SHARD, "2")]), Err(ConfigError::Invalid { key: SHARD, .. })));
        assert!(matches!(
            config(&[(POLL_BATCH, "0")]),
            Err(ConfigError::Invalid { key: POLL_BATCH, .. })
        ));
    }
}
