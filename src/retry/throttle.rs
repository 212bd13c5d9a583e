//! Channel-wide retry throttle (§4.7): a token bucket shared by every call on
//! the channel, so one method's retry storm throttles every other method too.

use crate::service_config::RetryThrottlingPolicy;
use std::sync::Mutex;

/// Tracks the token count for [`RetryThrottlingPolicy`]. Every failed attempt
/// costs one token (floor zero); every successful attempt refunds
/// `token_ratio` tokens (capped at `max_tokens`). Retries and hedges are only
/// allowed while the bucket holds more than half its capacity.
pub(crate) struct Throttle {
    policy: RetryThrottlingPolicy,
    tokens: Mutex<f64>,
}

impl Throttle {
    pub(crate) fn new(policy: RetryThrottlingPolicy) -> Self {
        Throttle {
            tokens: Mutex::new(policy.max_tokens),
            policy,
        }
    }

    pub(crate) fn record_failure(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens - 1.0).max(0.0);
    }

    pub(crate) fn record_success(&self) {
        let mut tokens = self.tokens.lock().unwrap();
        *tokens = (*tokens + self.policy.token_ratio).min(self.policy.max_tokens);
    }

    pub(crate) fn allow_retry(&self) -> bool {
        *self.tokens.lock().unwrap() > self.policy.max_tokens / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryThrottlingPolicy {
        RetryThrottlingPolicy {
            max_tokens: 10.0,
            token_ratio: 0.5,
        }
    }

    #[test]
    fn starts_full_and_allows_retries() {
        let throttle = Throttle::new(policy());
        assert!(throttle.allow_retry());
    }

    #[test]
    fn repeated_failures_stop_retries_below_half() {
        let throttle = Throttle::new(policy());
        for _ in 0..6 {
            throttle.record_failure();
        }
        assert!(!throttle.allow_retry());
    }

    #[test]
    fn tokens_never_go_negative() {
        let throttle = Throttle::new(policy());
        for _ in 0..100 {
            throttle.record_failure();
        }
        assert_eq!(*throttle.tokens.lock().unwrap(), 0.0);
    }

    #[test]
    fn success_refunds_are_capped_at_max() {
        let throttle = Throttle::new(policy());
        for _ in 0..100 {
            throttle.record_success();
        }
        assert_eq!(*throttle.tokens.lock().unwrap(), policy().max_tokens);
    }
}
