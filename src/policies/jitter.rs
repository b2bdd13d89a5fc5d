//! # Jitter applied to restart delays.
//!
//! Many workers crashing at once (a database restart takes every exporter down
//! with it) must not all come back on the same tick. [`JitterPolicy`] spreads
//! them out:
//!
//! - [`JitterPolicy::None`]: exact base delay, for tests and single workers
//! - [`JitterPolicy::Full`]: random in `[floor, base]`
//! - [`JitterPolicy::Equal`]: `base/2 + random[0, base/2]`, never below `floor`
//! - [`JitterPolicy::Decorrelated`]: random in `[floor, prev × 3]`, capped (default)

use std::time::Duration;

use rand::Rng;

/// Randomization strategy for restart delays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// No jitter: use the exact exponential delay.
    None,

    /// Full jitter: random delay in `[floor, base]`.
    Full,

    /// Equal jitter: half the base delay plus a random half.
    Equal,

    /// Decorrelated jitter: random delay in `[floor, prev × 3]`, capped at the ceiling.
    ///
    /// Grows with every call on average, but the first delay after a reset stays
    /// close to the floor.
    #[default]
    Decorrelated,
}

impl JitterPolicy {
    /// Applies jitter to an exponential `base` delay, keeping the result in `[floor, base]`.
    ///
    /// For `Decorrelated` the base is returned unchanged; use
    /// [`apply_decorrelated`](Self::apply_decorrelated) which needs the previous delay.
    pub fn apply(&self, floor: Duration, base: Duration) -> Duration {
        match self {
            JitterPolicy::None | JitterPolicy::Decorrelated => base,
            JitterPolicy::Full => random_between(floor, base),
            JitterPolicy::Equal => {
                let half = base / 2;
                (half + random_between(Duration::ZERO, half)).max(floor.min(base))
            }
        }
    }

    /// Decorrelated jitter: random in `[floor, min(prev × 3, ceiling)]`.
    pub fn apply_decorrelated(&self, floor: Duration, prev: Duration, ceiling: Duration) -> Duration {
        let upper = prev.saturating_mul(3).min(ceiling).max(floor);
        random_between(floor, upper)
    }
}

/// Uniform random duration in `[lo, hi]` with millisecond resolution.
fn random_between(lo: Duration, hi: Duration) -> Duration {
    let lo_ms = lo.as_millis().min(u128::from(u64::MAX)) as u64;
    let hi_ms = hi.as_millis().min(u128::from(u64::MAX)) as u64;
    if lo_ms >= hi_ms {
        return lo.min(hi);
    }
    Duration::from_millis(rand::rng().random_range(lo_ms..=hi_ms))
}
