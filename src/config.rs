//! Bucket-type configuration: the declarative source shape and its normalized form.
//!
//! A bucket definition names exactly one interval key (`per_second`, `per_minute`,
//! `per_hour`, `per_day`, `per_month`), an optional `size`, and optional `overrides`
//! keyed by instance-id prefix. Overrides have the same shape and are normalized
//! recursively.
//!
//! ```rust
//! use limitd::config::{BucketConfig, BucketSource};
//!
//! let source: BucketSource = serde_json::from_str(
//!     r#"{ "per_second": 5, "size": 10, "overrides": { "127.0.0.1": { "per_second": 100 } } }"#,
//! ).unwrap();
//! let config = BucketConfig::normalize("ip", &source).unwrap();
//! assert_eq!(config.size(), 10);
//! assert_eq!(config.interval_ms(), 1_000);
//! assert_eq!(config.resolve("127.0.0.1").size(), 100);
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Milliseconds in one `per_second` interval.
pub const SECOND_MS: u64 = 1_000;
/// Milliseconds in one `per_minute` interval.
pub const MINUTE_MS: u64 = 60 * SECOND_MS;
/// Milliseconds in one `per_hour` interval.
pub const HOUR_MS: u64 = 60 * MINUTE_MS;
/// Milliseconds in one `per_day` interval.
pub const DAY_MS: u64 = 24 * HOUR_MS;
/// Milliseconds in one `per_month` interval (30 days).
pub const MONTH_MS: u64 = 30 * DAY_MS;

const DEFAULT_RETENTION_MS: u64 = 60_000;
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;
const DEFAULT_MAX_WAIT_MS: u64 = 60_000;

/// Declarative bucket definition as it appears in the configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSource {
    /// Tokens per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_second: Option<u64>,
    /// Tokens per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u64>,
    /// Tokens per hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u64>,
    /// Tokens per day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u64>,
    /// Tokens per 30-day month.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_month: Option<u64>,
    /// Bucket capacity; defaults to the interval value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Never limit matching instances.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unlimited: bool,
    /// Per-prefix exceptions.
    #[serde(default, alias = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub overrides: BTreeMap<String, BucketSource>,
}

impl BucketSource {
    fn intervals(&self) -> impl Iterator<Item = (&'static str, u64, u64)> {
        [
            ("per_second", self.per_second, SECOND_MS),
            ("per_minute", self.per_minute, MINUTE_MS),
            ("per_hour", self.per_hour, HOUR_MS),
            ("per_day", self.per_day, DAY_MS),
            ("per_month", self.per_month, MONTH_MS),
        ]
        .into_iter()
        .filter_map(|(key, value, ms)| value.map(|v| (key, v, ms)))
    }
}

/// An override entry: instances whose id starts with `pattern` use `config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pattern: String,
    config: BucketConfig,
}

impl Override {
    /// Instance-id prefix this override applies to.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Quota used by matching instances.
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }
}

/// Normalized, immutable configuration of one bucket type (or one override).
///
/// `size`, `interval_ms` and `per_interval` are always positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    size: u64,
    interval_ms: u64,
    per_interval: u64,
    unlimited: bool,
    // Longest pattern first.
    overrides: Vec<Override>,
}

impl BucketConfig {
    /// Normalize a source definition. `name` is used in error paths only.
    pub fn normalize(name: &str, source: &BucketSource) -> Result<Self, ConfigError> {
        normalize_at(name.to_string(), source)
    }

    /// Build a plain config without overrides, validating positivity.
    pub fn new(size: u64, interval: Duration, per_interval: u64) -> Result<Self, ConfigError> {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        for (field, value) in
            [("size", size), ("interval", interval_ms), ("per_interval", per_interval)]
        {
            if value == 0 {
                return Err(ConfigError::ZeroValue { path: "<inline>".into(), field });
            }
        }
        Ok(Self { size, interval_ms, per_interval, unlimited: false, overrides: Vec::new() })
    }

    /// Maximum tokens an instance can hold.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Refill period in milliseconds.
    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    /// Tokens granted per refill period.
    pub fn per_interval(&self) -> u64 {
        self.per_interval
    }

    /// Whether matching instances bypass limiting entirely.
    pub fn is_unlimited(&self) -> bool {
        self.unlimited
    }

    /// Overrides, longest pattern first.
    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    /// Resolve the effective configuration for `instance`.
    ///
    /// The longest override pattern that prefixes the instance id wins (an exact
    /// match is the longest possible prefix); resolution then recurses into that
    /// override's own overrides. Without a match the base config applies.
    pub fn resolve(&self, instance: &str) -> &BucketConfig {
        match self.overrides.iter().find(|o| instance.starts_with(o.pattern.as_str())) {
            Some(o) => o.config.resolve(instance),
            None => self,
        }
    }
}

fn normalize_at(path: String, source: &BucketSource) -> Result<BucketConfig, ConfigError> {
    let intervals: Vec<_> = source.intervals().collect();
    let (interval_ms, per_interval) = match intervals.as_slice() {
        [(_, per, ms)] => (*ms, *per),
        [] if source.unlimited => (SECOND_MS, source.size.unwrap_or(1)),
        [] => return Err(ConfigError::MissingInterval { path }),
        many => {
            let keys = many.iter().map(|(k, _, _)| *k).collect::<Vec<_>>().join(", ");
            return Err(ConfigError::AmbiguousInterval { path, keys });
        }
    };
    if per_interval == 0 {
        return Err(ConfigError::ZeroValue { path, field: "per_interval" });
    }
    let size = source.size.unwrap_or(per_interval);
    if size == 0 {
        return Err(ConfigError::ZeroValue { path, field: "size" });
    }

    let mut overrides = source
        .overrides
        .iter()
        .map(|(pattern, nested)| {
            let config = normalize_at(format!("{path}.overrides.{pattern}"), nested)?;
            Ok(Override { pattern: pattern.clone(), config })
        })
        .collect::<Result<Vec<_>, ConfigError>>()?;
    overrides.sort_by(|a, b| b.pattern.len().cmp(&a.pattern.len()).then(a.pattern.cmp(&b.pattern)));

    Ok(BucketConfig { size, interval_ms, per_interval, unlimited: source.unlimited, overrides })
}

/// Whole-process configuration document.
///
/// ```json
/// {
///   "buckets": { "ip": { "per_second": 5, "size": 10 } },
///   "retention_ms": 60000,
///   "sweep_interval_ms": 1000,
///   "max_wait_ms": 60000
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitdConfig {
    /// Bucket type name -> definition.
    pub buckets: BTreeMap<String, BucketSource>,
    /// How long a fully recovered instance may sit idle before its record is evicted.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Period of the idle-eviction sweep.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    /// WAIT requests needing a longer delay are answered non-conformant right away.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

fn default_retention_ms() -> u64 {
    DEFAULT_RETENTION_MS
}

fn default_sweep_interval_ms() -> u64 {
    DEFAULT_SWEEP_INTERVAL_MS
}

fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}

impl Default for LimitdConfig {
    fn default() -> Self {
        Self {
            buckets: BTreeMap::new(),
            retention_ms: DEFAULT_RETENTION_MS,
            sweep_interval_ms: DEFAULT_SWEEP_INTERVAL_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl LimitdConfig {
    /// Parse a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Add (or replace) a bucket definition; handy for tests and embedding.
    pub fn with_bucket(mut self, name: impl Into<String>, source: BucketSource) -> Self {
        self.buckets.insert(name.into(), source);
        self
    }

    /// Normalize every bucket definition, failing on the first malformed one.
    pub fn normalize(&self) -> Result<BTreeMap<String, BucketConfig>, ConfigError> {
        self.buckets
            .iter()
            .map(|(name, source)| Ok((name.clone(), BucketConfig::normalize(name, source)?)))
            .collect()
    }

    /// Idle window after which full instances are evicted.
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Sweep period.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// WAIT ceiling.
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}
