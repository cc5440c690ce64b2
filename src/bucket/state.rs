//! Per-instance token arithmetic.
//!
//! Everything here is pure: callers pass `now` in and persist what comes out.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::BucketConfig;

/// Persisted state of one bucket instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceState {
    /// Whole tokens available as of `last_drip`.
    pub remaining: u64,
    /// Millisecond timestamp up to which accrual has been credited.
    pub last_drip: u64,
}

impl InstanceState {
    /// State of an instance with no record: full, as of `now`.
    pub fn full(config: &BucketConfig, now: u64) -> Self {
        Self { remaining: config.size(), last_drip: now }
    }

    /// Credit tokens accrued between `last_drip` and `now`.
    ///
    /// Only whole tokens are credited and `last_drip` advances by the time those
    /// tokens took, rounded up to the millisecond, so the unused remainder carries
    /// into the next call and nothing is credited twice.
    /// A full bucket accrues nothing, so its `last_drip` jumps to `now`.
    /// A clock that moved backwards yields zero accrual.
    pub fn drip(self, config: &BucketConfig, now: u64) -> Self {
        let size = config.size();
        if self.remaining >= size {
            return Self { remaining: size, last_drip: now.max(self.last_drip) };
        }
        let elapsed = now.saturating_sub(self.last_drip);
        let accrued = mul_div_floor(elapsed, config.per_interval(), config.interval_ms());
        if accrued == 0 {
            return self;
        }
        let remaining = self.remaining.saturating_add(accrued);
        if remaining >= size {
            return Self { remaining: size, last_drip: now };
        }
        let consumed = mul_div_ceil(accrued, config.interval_ms(), config.per_interval());
        Self { remaining, last_drip: self.last_drip.saturating_add(consumed) }
    }

    /// Remove `count` tokens. Callers check availability first.
    pub fn consume(self, count: u64) -> Self {
        Self { remaining: self.remaining.saturating_sub(count), ..self }
    }

    /// Add `tokens`, capped at the bucket size.
    pub fn refill(self, config: &BucketConfig, tokens: u64) -> Self {
        Self { remaining: self.remaining.saturating_add(tokens).min(config.size()), ..self }
    }

    /// Whether the instance holds its full capacity.
    pub fn is_full(&self, config: &BucketConfig) -> bool {
        self.remaining >= config.size()
    }

    /// UNIX second at which the instance is fully replenished.
    pub fn reset_secs(&self, config: &BucketConfig) -> u64 {
        let missing = config.size().saturating_sub(self.remaining);
        let to_full = mul_div_ceil(missing, config.interval_ms(), config.per_interval());
        self.last_drip.saturating_add(to_full).div_ceil(1_000)
    }

    /// Time from `now` until `count` tokens are available.
    ///
    /// `None` when `count` exceeds the bucket size and can never be satisfied.
    /// Zero when the tokens are already there.
    pub fn delay_for(&self, config: &BucketConfig, count: u64, now: u64) -> Option<Duration> {
        if count > config.size() {
            return None;
        }
        if self.remaining >= count {
            return Some(Duration::ZERO);
        }
        let missing = count - self.remaining;
        let needed = mul_div_ceil(missing, config.interval_ms(), config.per_interval());
        let since_drip = now.saturating_sub(self.last_drip);
        Some(Duration::from_millis(needed.saturating_sub(since_drip).max(1)))
    }
}

fn mul_div_floor(a: u64, b: u64, c: u64) -> u64 {
    let v = u128::from(a) * u128::from(b) / u128::from(c);
    u64::try_from(v).unwrap_or(u64::MAX)
}

fn mul_div_ceil(a: u64, b: u64, c: u64) -> u64 {
    let v = (u128::from(a) * u128::from(b)).div_ceil(u128::from(c));
    u64::try_from(v).unwrap_or(u64::MAX)
}
