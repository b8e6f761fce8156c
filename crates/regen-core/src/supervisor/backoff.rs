//! Restart delays for workers that keep failing to start.
//!
//! The delay for attempt `n` is `first × 2^n`, clamped to `max`, with equal
//! jitter applied: half the delay is fixed and the other half is random.
//! Jitter never feeds back into the next attempt's base delay.

use std::time::Duration;

use rand::Rng;

const FACTOR: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct RestartBackoff {
    pub first: Duration,
    pub max: Duration,
}

impl RestartBackoff {
    /// Base delay for the given attempt (0-indexed), before jitter.
    pub fn base(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * FACTOR.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    pub fn next(&self, attempt: u32) -> Duration {
        equal_jitter(self.base(attempt), &mut rand::rng())
    }
}

fn equal_jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    let ms = delay.as_millis() as u64;
    let half = ms / 2;
    if half == 0 {
        return delay;
    }
    Duration::from_millis(half + rng.random_range(0..=half))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn backoff() -> RestartBackoff {
        RestartBackoff {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_base_doubles_until_capped() {
        let policy = backoff();
        assert_eq!(policy.base(0), Duration::from_millis(100));
        assert_eq!(policy.base(1), Duration::from_millis(200));
        assert_eq!(policy.base(3), Duration::from_millis(800));
        assert_eq!(policy.base(6), Duration::from_secs(5));
        assert_eq!(policy.base(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_within_half_and_full_delay() {
        let policy = backoff();
        let mut rng = StdRng::seed_from_u64(7);
        for attempt in 0..8 {
            let base = policy.base(attempt);
            for _ in 0..50 {
                let delay = equal_jitter(base, &mut rng);
                assert!(delay >= base / 2, "{delay:?} below half of {base:?}");
                assert!(delay <= base, "{delay:?} above {base:?}");
            }
        }
    }

    #[test]
    fn test_tiny_delays_are_not_jittered() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(equal_jitter(Duration::from_millis(1), &mut rng), Duration::from_millis(1));
        assert_eq!(equal_jitter(Duration::ZERO, &mut rng), Duration::ZERO);
    }

    #[test]
    fn test_next_is_bounded_by_the_base_delay() {
        let policy = backoff();
        let delay = policy.next(2);
        assert!(delay >= Duration::from_millis(200) && delay <= Duration::from_millis(400));
    }
}
