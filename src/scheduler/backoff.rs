//! # Stage retry backoff
//!
//! A failing stage is rescheduled `backoff` seconds in the future instead of
//! advancing. The first failure waits [`BackoffPolicy::floor`], every
//! consecutive failure doubles the previous wait, and the wait never exceeds
//! [`BackoffPolicy::max`]. Any success resets the task's backoff to zero.
//!
//! ```rust
//! use aegis_signer::scheduler::BackoffPolicy;
//!
//! let policy = BackoffPolicy { floor: 60, max: 3600 };
//! assert_eq!(policy.next(0), 60);
//! assert_eq!(policy.next(60), 120);
//! assert_eq!(policy.next(2400), 3600);
//! ```

use serde::{Deserialize, Serialize};

/// Retry backoff policy, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Wait after the first failure.
    #[serde(rename = "floor_secs")]
    pub floor: u64,
    /// Upper bound on any wait.
    #[serde(rename = "max_secs")]
    pub max: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            floor: 60,
            max: 3600,
        }
    }
}

impl BackoffPolicy {
    /// Computes the backoff that follows `current` after one more failure.
    ///
    /// `current == 0` means the last attempt succeeded (or there was none).
    pub fn next(&self, current: u64) -> u64 {
        let floor = self.floor.min(self.max);
        if current == 0 {
            floor
        } else {
            current.saturating_mul(2).clamp(floor, self.max)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_failure_uses_floor() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.next(0), 60);
    }

    #[test]
    fn test_doubles_until_cap() {
        let policy = BackoffPolicy { floor: 60, max: 3600 };
        let mut backoff = 0;
        let mut seen = Vec::new();
        for _ in 0..10 {
            backoff = policy.next(backoff);
            seen.push(backoff);
        }
        assert_eq!(&seen[..7], &[60, 120, 240, 480, 960, 1920, 3600]);
        assert!(seen[7..].iter().all(|b| *b == 3600));
    }

    #[test]
    fn test_floor_above_max_is_clamped() {
        let policy = BackoffPolicy { floor: 500, max: 100 };
        assert_eq!(policy.next(0), 100);
        assert_eq!(policy.next(100), 100);
    }

    #[test]
    fn test_huge_backoff_does_not_overflow() {
        let policy = BackoffPolicy { floor: 1, max: u64::MAX };
        assert_eq!(policy.next(u64::MAX), u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_backoff_non_decreasing_and_capped(
            floor in 1u64..10_000,
            max in 1u64..100_000,
            failures in 1usize..64,
        ) {
            let policy = BackoffPolicy { floor, max };
            let mut backoff = 0;
            let mut previous = 0;
            for _ in 0..failures {
                backoff = policy.next(backoff);
                prop_assert!(backoff >= previous);
                prop_assert!(backoff <= max);
                prop_assert!(backoff >= floor.min(max));
                previous = backoff;
            }
        }
    }
}
