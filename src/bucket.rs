//! Token bucket engine for one bucket type.
//!
//! A [`BucketEngine`] owns a normalized [`BucketConfig`] and a [`BucketStore`]
//! namespace and answers TAKE, WAIT, PUT and STATUS for the instances of its type.
//!
//! # State policy
//!
//! Instance state is computed on demand; nothing is cached between requests.
//! An instance with no record is full (`remaining == size`), so:
//! - reads that find nothing synthesize a full bucket as of `now`;
//! - a PUT that restores an instance to full deletes its record;
//! - the idle sweep may delete any record that has recovered to full.
//!
//! Mutations of one instance are serialized through a per-instance lock held
//! only across the load-compute-persist step. Different instances never contend.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::BucketConfig;
use crate::error::LimitdError;
use crate::store::{BucketStore, KvStore};

mod locks;
mod state;

use locks::InstanceLocks;
pub use state::InstanceState;

/// Default idle window before a full instance's record may be evicted.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);
/// Default ceiling on a WAIT delay.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(60);
/// Records read per storage round trip during an idle sweep.
const EVICTION_PAGE: usize = 256;

/// Result of a TAKE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeResponse {
    /// Whether the tokens were granted.
    pub conformant: bool,
    /// Tokens left after this request.
    pub remaining: u64,
    /// Bucket size.
    pub limit: u64,
    /// UNIX second at which the bucket is full again.
    pub reset: u64,
    /// When non-conformant: time until the requested tokens exist.
    /// `None` if the request can never conform.
    #[serde(skip)]
    pub delay: Option<Duration>,
}

/// Result of a PUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutResponse {
    /// Tokens held after the refill.
    pub remaining: u64,
    /// Bucket size.
    pub limit: u64,
    /// UNIX second at which the bucket is full again.
    pub reset: u64,
}

/// One instance as reported by STATUS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusItem {
    /// Instance id.
    pub instance: String,
    /// Live token count.
    pub remaining: u64,
    /// Bucket size.
    pub limit: u64,
    /// UNIX second at which the bucket is full again.
    pub reset: u64,
}

/// Result of a STATUS.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Matching instances, ascending by id.
    pub items: Vec<StatusItem>,
}

/// Engine-side answer to a WAIT: the engine never blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitDecision {
    /// Tokens were taken.
    Conformant(TakeResponse),
    /// Nothing was taken; retry after the given delay.
    RetryAfter {
        /// The non-conformant take.
        response: TakeResponse,
        /// Time until the requested tokens exist.
        delay: Duration,
    },
    /// Nothing was taken and waiting would exceed the ceiling (or never succeed).
    Rejected(TakeResponse),
}

/// Outcome of one idle-eviction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Records examined.
    pub scanned: usize,
    /// Records deleted.
    pub evicted: usize,
    /// Deletions that failed and were skipped.
    pub failed: usize,
}

impl std::ops::AddAssign for EvictionReport {
    fn add_assign(&mut self, rhs: Self) {
        self.scanned += rhs.scanned;
        self.evicted += rhs.evicted;
        self.failed += rhs.failed;
    }
}

/// Token bucket engine for one bucket type.
pub struct BucketEngine<S> {
    config: BucketConfig,
    store: BucketStore<S>,
    clock: Arc<dyn Clock>,
    locks: InstanceLocks,
    retention: Duration,
    max_wait: Duration,
}

impl<S> std::fmt::Debug for BucketEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketEngine")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("retention", &self.retention)
            .field("max_wait", &self.max_wait)
            .finish_non_exhaustive()
    }
}

impl<S: KvStore> BucketEngine<S> {
    /// Create an engine over `store` using the wall clock and default windows.
    pub fn new(config: BucketConfig, store: BucketStore<S>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            locks: InstanceLocks::new(),
            retention: DEFAULT_RETENTION,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Idle window after which full instances are evicted.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Longest delay a WAIT may be asked to sit out.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Bucket type name.
    pub fn name(&self) -> &str {
        self.store.bucket()
    }

    /// Base configuration (before overrides).
    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    /// WAIT ceiling.
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Consume `count` tokens from `instance` if available.
    pub async fn take(&self, instance: &str, count: u64) -> Result<TakeResponse, LimitdError> {
        validate_instance(instance)?;
        validate_amount("count", count)?;
        let config = self.config.resolve(instance);
        if config.is_unlimited() {
            return Ok(unlimited(config, self.clock.now_millis()));
        }

        let _guard = self.locks.lock(instance).await;
        let now = self.clock.now_millis();
        let stored = self.store.get(instance).await?;
        let current = stored.unwrap_or_else(|| InstanceState::full(config, now)).drip(config, now);

        if current.remaining >= count {
            let next = current.consume(count);
            self.store.put(instance, &next).await?;
            return Ok(TakeResponse {
                conformant: true,
                remaining: next.remaining,
                limit: config.size(),
                reset: next.reset_secs(config),
                delay: None,
            });
        }

        // Persist the refreshed (undeducted) state; an absent record is already full.
        if stored.is_some_and(|before| before != current) {
            self.store.put(instance, &current).await?;
        }
        let delay = current.delay_for(config, count, now);
        debug!(
            target: "limitd::bucket",
            bucket = %self.name(),
            instance = %instance,
            count,
            remaining = current.remaining,
            "non-conformant take"
        );
        Ok(TakeResponse {
            conformant: false,
            remaining: current.remaining,
            limit: config.size(),
            reset: current.reset_secs(config),
            delay,
        })
    }

    /// TAKE, plus how long the caller should hold off if it was non-conformant.
    ///
    /// Delays beyond [`max_wait`](Self::max_wait), and requests larger than the
    /// bucket, are rejected outright.
    pub async fn wait(&self, instance: &str, count: u64) -> Result<WaitDecision, LimitdError> {
        let response = self.take(instance, count).await?;
        if response.conformant {
            return Ok(WaitDecision::Conformant(response));
        }
        Ok(match response.delay {
            Some(delay) if delay <= self.max_wait => WaitDecision::RetryAfter { response, delay },
            _ => WaitDecision::Rejected(response),
        })
    }

    /// Refill `instance` by `tokens` (or completely when `None`), capped at size.
    pub async fn put(&self, instance: &str, tokens: Option<u64>) -> Result<PutResponse, LimitdError> {
        validate_instance(instance)?;
        if let Some(tokens) = tokens {
            validate_amount("tokens", tokens)?;
        }
        let config = self.config.resolve(instance);
        let now = self.clock.now_millis();
        if config.is_unlimited() {
            return Ok(PutResponse { remaining: config.size(), limit: config.size(), reset: now.div_ceil(1_000) });
        }

        let _guard = self.locks.lock(instance).await;
        let now = self.clock.now_millis();
        let next = match (tokens, self.store.get(instance).await?) {
            (Some(tokens), Some(stored)) => stored.drip(config, now).refill(config, tokens),
            _ => InstanceState::full(config, now),
        };
        if next.is_full(config) {
            self.store.delete(instance).await?;
        } else {
            self.store.put(instance, &next).await?;
        }
        Ok(PutResponse { remaining: next.remaining, limit: config.size(), reset: next.reset_secs(config) })
    }

    /// Live state of every instance whose id starts with `prefix`.
    ///
    /// Nothing is persisted and no record is created.
    pub async fn status(&self, prefix: &str) -> Result<StatusResponse, LimitdError> {
        validate_instance(prefix)?;
        let rows = self.store.scan(prefix).await?;
        let now = self.clock.now_millis();
        let items = rows
            .into_iter()
            .map(|(instance, stored)| {
                let config = self.config.resolve(&instance);
                let live = stored.drip(config, now);
                StatusItem {
                    remaining: live.remaining,
                    limit: config.size(),
                    reset: live.reset_secs(config),
                    instance,
                }
            })
            .collect();
        Ok(StatusResponse { items })
    }

    /// Delete records that are full again and untouched for the retention window.
    ///
    /// Candidates are re-checked under their instance lock before deletion.
    /// Individual delete failures are logged and skipped; a failed scan is returned.
    pub async fn evict_idle(&self) -> Result<EvictionReport, LimitdError> {
        let mut report = EvictionReport::default();
        let mut after: Option<String> = None;
        loop {
            let page = self.store.scan_page(after.as_deref(), EVICTION_PAGE).await?;
            let Some((last, _)) = page.last() else {
                break;
            };
            after = Some(last.clone());
            let full_page = page.len() == EVICTION_PAGE;
            report.scanned += page.len();
            for (instance, stored) in page {
                if !self.is_idle(&instance, &stored, self.clock.now_millis()) {
                    continue;
                }
                match self.evict_one(&instance).await {
                    Ok(true) => report.evicted += 1,
                    Ok(false) => {}
                    Err(err) => {
                        report.failed += 1;
                        warn!(
                            target: "limitd::bucket",
                            bucket = %self.name(),
                            instance = %instance,
                            error = %err,
                            "idle eviction failed; skipping"
                        );
                    }
                }
            }
            if !full_page {
                break;
            }
        }
        Ok(report)
    }

    fn is_idle(&self, instance: &str, stored: &InstanceState, now: u64) -> bool {
        let config = self.config.resolve(instance);
        let idle_ms = u64::try_from(self.retention.as_millis()).unwrap_or(u64::MAX);
        config.is_unlimited()
            || (stored.drip(config, now).is_full(config)
                && now.saturating_sub(stored.last_drip) >= idle_ms)
    }

    async fn evict_one(&self, instance: &str) -> Result<bool, LimitdError> {
        let _guard = self.locks.lock(instance).await;
        let Some(stored) = self.store.get(instance).await? else {
            return Ok(false);
        };
        if !self.is_idle(instance, &stored, self.clock.now_millis()) {
            return Ok(false);
        }
        self.store.delete(instance).await?;
        debug!(target: "limitd::bucket", bucket = %self.name(), instance = %instance, "evicted idle instance");
        Ok(true)
    }
}

fn unlimited(config: &BucketConfig, now: u64) -> TakeResponse {
    TakeResponse {
        conformant: true,
        remaining: config.size(),
        limit: config.size(),
        reset: now.div_ceil(1_000),
        delay: None,
    }
}

fn validate_instance(instance: &str) -> Result<(), LimitdError> {
    if instance.is_empty() {
        return Err(LimitdError::InvalidArgument("instance id must not be empty".into()));
    }
    if instance.chars().any(char::is_control) {
        return Err(LimitdError::InvalidArgument(format!(
            "instance id {instance:?} contains control characters"
        )));
    }
    Ok(())
}

fn validate_amount(field: &str, value: u64) -> Result<(), LimitdError> {
    if value == 0 {
        return Err(LimitdError::InvalidArgument(format!("{field} must be > 0")));
    }
    Ok(())
}
