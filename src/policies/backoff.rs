//! # Restart delay generator.
//!
//! [`BackoffPolicy`] holds the knobs (floor, ceiling, growth factor, jitter);
//! [`Backoff`] is the stateful generator a single worker owns. Each call to
//! [`Backoff::delay`] without an intervening [`Backoff::reset`] yields a delay that
//! grows (randomly, per [`JitterPolicy`]) and always stays within `[min, max]`.
//!
//! A worker resets its generator every time it reaches `RUNNING`, so a process
//! that was stable for a while restarts quickly after its next crash.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use agentvisor::{Backoff, BackoffPolicy, JitterPolicy};
//!
//! let mut backoff = Backoff::with_policy(BackoffPolicy {
//!     min: Duration::from_millis(100),
//!     max: Duration::from_secs(10),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! });
//!
//! assert_eq!(backoff.delay(), Duration::from_millis(100));
//! assert_eq!(backoff.delay(), Duration::from_millis(200));
//! backoff.reset();
//! assert_eq!(backoff.delay(), Duration::from_millis(100));
//! ```

use std::time::Duration;

use serde::Deserialize;

use crate::policies::jitter::JitterPolicy;

/// Restart pacing parameters.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Floor: no delay is ever shorter.
    #[serde(with = "humantime_serde")]
    pub min: Duration,
    /// Ceiling: no delay is ever longer.
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Multiplicative growth for the non-decorrelated jitter policies.
    pub factor: f64,
    /// Randomization strategy.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns a policy with:
    /// - `min = 1s`;
    /// - `max = 30s`;
    /// - `factor = 2.0`;
    /// - `jitter = Decorrelated`.
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Decorrelated,
        }
    }
}

impl BackoffPolicy {
    /// Exponential base delay for `attempt` (0-indexed): `min × factor^attempt`, within `[min, max]`.
    fn base(&self, attempt: u32) -> Duration {
        let (min, max) = self.bounds();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = min.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs.max(0.0)).clamp(min, max)
        }
    }

    /// Returns `(min, max)` with `min <= max` guaranteed.
    fn bounds(&self) -> (Duration, Duration) {
        (self.min.min(self.max), self.max)
    }
}

/// Stateful delay generator owned by one worker.
///
/// Not shared between workers: each worker gets its own instance so that one
/// worker's crash loop does not slow down another's recovery.
#[derive(Clone, Debug)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    prev: Option<Duration>,
}

impl Backoff {
    /// Creates a generator with the given floor and ceiling and the default jitter.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self::with_policy(BackoffPolicy {
            min,
            max,
            ..BackoffPolicy::default()
        })
    }

    /// Creates a generator from a full policy.
    pub fn with_policy(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            prev: None,
        }
    }

    /// Returns the next delay and advances the generator.
    pub fn delay(&mut self) -> Duration {
        let (min, max) = self.policy.bounds();
        let delay = match self.policy.jitter {
            JitterPolicy::Decorrelated => match self.prev {
                // The first retry after a reset stays at the floor.
                None => min,
                Some(prev) => self.policy.jitter.apply_decorrelated(min, prev, max),
            },
            jitter => jitter.apply(min, self.policy.base(self.attempt)),
        };

        let delay = delay.clamp(min, max);
        self.attempt = self.attempt.saturating_add(1);
        self.prev = Some(delay);
        delay
    }

    /// Returns the generator to its initial state.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.prev = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            min: Duration::from_millis(100),
            max: Duration::from_secs(3),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut b = Backoff::with_policy(policy(JitterPolicy::None));
        let got: Vec<_> = (0..7).map(|_| b.delay()).collect();
        let ms: Vec<u128> = got.iter().map(Duration::as_millis).collect();
        assert_eq!(ms, vec![100, 200, 400, 800, 1600, 3000, 3000]);
    }

    #[test]
    fn test_reset_returns_to_floor() {
        let mut b = Backoff::with_policy(policy(JitterPolicy::None));
        for _ in 0..5 {
            b.delay();
        }
        b.reset();
        assert_eq!(b.delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_every_policy_stays_within_bounds() {
        for jitter in [
            JitterPolicy::None,
            JitterPolicy::Full,
            JitterPolicy::Equal,
            JitterPolicy::Decorrelated,
        ] {
            let mut b = Backoff::with_policy(policy(jitter));
            for _ in 0..100 {
                let d = b.delay();
                assert!(d >= Duration::from_millis(100), "{jitter:?}: {d:?} below min");
                assert!(d <= Duration::from_secs(3), "{jitter:?}: {d:?} above max");
            }
        }
    }

    #[test]
    fn test_decorrelated_first_delay_is_floor() {
        let mut b = Backoff::new(Duration::from_millis(250), Duration::from_secs(30));
        assert_eq!(b.delay(), Duration::from_millis(250));
        b.delay();
        b.reset();
        assert_eq!(b.delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_decorrelated_reaches_ceiling_eventually() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_secs(3));
        let max_seen = (0..200).map(|_| b.delay()).max().unwrap_or_default();
        assert!(max_seen >= Duration::from_secs(1), "max_seen {max_seen:?} suspiciously low");
    }

    #[test]
    fn test_inverted_bounds_clamp_to_max() {
        let mut b = Backoff::new(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(b.delay(), Duration::from_secs(5));
    }

    #[test]
    fn test_huge_attempt_clamps_to_max() {
        let mut b = Backoff::with_policy(policy(JitterPolicy::None));
        b.attempt = u32::MAX - 1;
        assert_eq!(b.delay(), Duration::from_secs(3));
        assert_eq!(b.delay(), Duration::from_secs(3));
    }
}
