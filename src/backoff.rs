//! Jittered exponential backoff, shared between resolver polling (§4.1) and
//! subchannel reconnection (§4.3) so the two policies cannot drift.

use rand::Rng;
use std::time::Duration;

/// Configuration for a jittered exponential backoff schedule.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the computed delay randomized, e.g. `0.2` for ±20%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(1000),
            max: Duration::from_secs(120),
            multiplier: 1.6,
            jitter: 0.2,
        }
    }
}

/// Stateful backoff counter. Each call to [`Backoff::next_delay`] advances
/// the attempt count; [`Backoff::reset`] returns it to the initial delay
/// (called after a successful connect/resolve).
#[derive(Clone, Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Backoff { config, attempt: 0 }
    }

    /// Reset the schedule after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// The delay to wait before the next attempt, advancing internal state.
    pub fn next_delay(&mut self) -> Duration {
        let base_millis = self.config.initial.as_millis() as f64
            * self.config.multiplier.powi(self.attempt as i32);
        let max_millis = self.config.max.as_millis() as f64;
        let capped = base_millis.min(max_millis);

        self.attempt = self.attempt.saturating_add(1);

        let jitter_span = capped * self.config.jitter;
        let jittered = if jitter_span > 0.0 {
            let mut rng = rand::thread_rng();
            capped + rng.gen_range(-jitter_span..=jitter_span)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_never_exceeds_max_plus_jitter() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: 0.2,
        };
        let mut backoff = Backoff::new(config);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay <= Duration::from_millis(600));
        }
    }

    #[test]
    fn reset_restarts_from_initial() {
        let config = BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: 0.0,
        };
        let mut backoff = Backoff::new(config);
        let _ = backoff.next_delay();
        let _ = backoff.next_delay();
        backoff.reset();
        let delay = backoff.next_delay();
        assert_eq!(delay, Duration::from_millis(100));
    }
}
