//! Service config document (§3): load-balancing policy preferences, per-method
//! retry/hedging policies, and channel-wide retry throttling.

use crate::Code;
use std::time::Duration;

/// One method's retry policy (§4.7).
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<Code>,
}

/// One method's hedging policy (§4.7).
#[derive(Clone, Debug)]
pub struct HedgingPolicy {
    pub max_attempts: u32,
    pub hedging_delay: Duration,
    pub non_fatal_status_codes: Vec<Code>,
}

/// Either a retry or a hedging policy for one method — never both (§4.7:
/// "the two policies are mutually exclusive per method").
#[derive(Clone, Debug)]
pub enum MethodPolicy {
    Retry(RetryPolicy),
    Hedging(HedgingPolicy),
}

/// A method config keyed by `(service?, method?)` (§3).
#[derive(Clone, Debug)]
pub struct MethodConfig {
    pub service: Option<String>,
    pub method: Option<String>,
    pub policy: Option<MethodPolicy>,
}

/// Channel-wide retry throttling (§4.7).
#[derive(Clone, Copy, Debug)]
pub struct RetryThrottlingPolicy {
    pub max_tokens: f64,
    pub token_ratio: f64,
}

/// A service config document: ordered load-balancing policy preferences, a
/// set of method configs, and an optional retry throttling policy (§3).
#[derive(Clone, Debug, Default)]
pub struct ServiceConfig {
    load_balancing_policy_names: Vec<String>,
    method_configs: Vec<MethodConfig>,
    retry_throttling: Option<RetryThrottlingPolicy>,
}

/// A validation failure raised when building a [`ServiceConfig`] (§4.7 supplement).
///
/// `MethodPolicy` is an enum of `Retry`/`Hedging`, so a method config can
/// never carry both at once — that mutual exclusion is enforced by the type
/// itself, not by a validation error here.
#[derive(Debug, PartialEq, Eq)]
pub enum ServiceConfigError {
    MaxAttemptsIsZero,
}

impl std::fmt::Display for ServiceConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceConfigError::MaxAttemptsIsZero => write!(f, "max_attempts must be >= 1"),
        }
    }
}

impl std::error::Error for ServiceConfigError {}

pub struct ServiceConfigBuilder {
    load_balancing_policy_names: Vec<String>,
    method_configs: Vec<MethodConfig>,
    retry_throttling: Option<RetryThrottlingPolicy>,
}

impl ServiceConfigBuilder {
    pub fn new() -> Self {
        ServiceConfigBuilder {
            load_balancing_policy_names: Vec::new(),
            method_configs: Vec::new(),
            retry_throttling: None,
        }
    }

    pub fn load_balancing_policy(mut self, name: impl Into<String>) -> Self {
        self.load_balancing_policy_names.push(name.into());
        self
    }

    pub fn method_config(mut self, config: MethodConfig) -> Self {
        self.method_configs.push(config);
        self
    }

    pub fn retry_throttling(mut self, policy: RetryThrottlingPolicy) -> Self {
        self.retry_throttling = Some(policy);
        self
    }

    /// Validate and cap retry attempts against the channel's
    /// `MaxRetryAttempts`, matching how the reference implementation
    /// validates method configs at parse time rather than first use.
    pub fn build(mut self, max_retry_attempts: u32) -> Result<ServiceConfig, ServiceConfigError> {
        for mc in &mut self.method_configs {
            match &mut mc.policy {
                Some(MethodPolicy::Retry(r)) => {
                    if r.max_attempts == 0 {
                        return Err(ServiceConfigError::MaxAttemptsIsZero);
                    }
                    r.max_attempts = r.max_attempts.min(max_retry_attempts);
                }
                Some(MethodPolicy::Hedging(h)) => {
                    if h.max_attempts == 0 {
                        return Err(ServiceConfigError::MaxAttemptsIsZero);
                    }
                    h.max_attempts = h.max_attempts.min(max_retry_attempts);
                }
                None => {}
            }
        }

        Ok(ServiceConfig {
            load_balancing_policy_names: self.load_balancing_policy_names,
            method_configs: self.method_configs,
            retry_throttling: self.retry_throttling,
        })
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceConfig {
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    /// Re-validates and re-caps every method's `max_attempts` against a
    /// (possibly different) channel `MaxRetryAttempts`, the same rule
    /// `ServiceConfigBuilder::build` applies at first construction. Used when
    /// an already-built inline [`ServiceConfig`] is attached to a [`crate::Channel`]
    /// whose `max_retry_attempts` wasn't known at the time it was built.
    pub(crate) fn cap_retry_attempts(&mut self, max_retry_attempts: u32) -> Result<(), ServiceConfigError> {
        for mc in &mut self.method_configs {
            match &mut mc.policy {
                Some(MethodPolicy::Retry(r)) => {
                    if r.max_attempts == 0 {
                        return Err(ServiceConfigError::MaxAttemptsIsZero);
                    }
                    r.max_attempts = r.max_attempts.min(max_retry_attempts);
                }
                Some(MethodPolicy::Hedging(h)) => {
                    if h.max_attempts == 0 {
                        return Err(ServiceConfigError::MaxAttemptsIsZero);
                    }
                    h.max_attempts = h.max_attempts.min(max_retry_attempts);
                }
                None => {}
            }
        }
        Ok(())
    }

    /// The policy names in preference order; `ChildHandlerLoadBalancer` uses
    /// the first one, falling back to the currently active policy if it
    /// doesn't recognize it.
    pub fn load_balancing_policy_names(&self) -> &[String] {
        &self.load_balancing_policy_names
    }

    pub fn retry_throttling(&self) -> Option<RetryThrottlingPolicy> {
        self.retry_throttling
    }

    /// Lookup order: (service,method) -> (service,*) -> (*,*) -> none (§3).
    pub fn method_policy(&self, service: &str, method: &str) -> Option<&MethodPolicy> {
        let exact = self.method_configs.iter().find(|mc| {
            mc.service.as_deref() == Some(service) && mc.method.as_deref() == Some(method)
        });
        if let Some(mc) = exact {
            return mc.policy.as_ref();
        }

        let service_only = self
            .method_configs
            .iter()
            .find(|mc| mc.service.as_deref() == Some(service) && mc.method.is_none());
        if let Some(mc) = service_only {
            return mc.policy.as_ref();
        }

        let wildcard = self
            .method_configs
            .iter()
            .find(|mc| mc.service.is_none() && mc.method.is_none());
        wildcard.and_then(|mc| mc.policy.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry(max_attempts: u32) -> MethodPolicy {
        MethodPolicy::Retry(RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![Code::Unavailable],
        })
    }

    #[test]
    fn exact_match_wins_over_wildcard() {
        let sc = ServiceConfig::builder()
            .method_config(MethodConfig {
                service: None,
                method: None,
                policy: Some(retry(2)),
            })
            .method_config(MethodConfig {
                service: Some("svc".into()),
                method: Some("m".into()),
                policy: Some(retry(5)),
            })
            .build(10)
            .unwrap();

        match sc.method_policy("svc", "m") {
            Some(MethodPolicy::Retry(r)) => assert_eq!(r.max_attempts, 5),
            _ => panic!("expected retry policy"),
        }
        match sc.method_policy("svc", "other") {
            Some(MethodPolicy::Retry(r)) => assert_eq!(r.max_attempts, 2),
            _ => panic!("expected wildcard retry policy"),
        }
    }

    #[test]
    fn max_attempts_is_capped_by_channel_limit() {
        let sc = ServiceConfig::builder()
            .method_config(MethodConfig {
                service: None,
                method: None,
                policy: Some(retry(100)),
            })
            .build(5)
            .unwrap();

        match sc.method_policy("any", "any") {
            Some(MethodPolicy::Retry(r)) => assert_eq!(r.max_attempts, 5),
            _ => panic!("expected retry policy"),
        }
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = ServiceConfig::builder()
            .method_config(MethodConfig {
                service: None,
                method: None,
                policy: Some(retry(0)),
            })
            .build(5)
            .unwrap_err();
        assert_eq!(err, ServiceConfigError::MaxAttemptsIsZero);
    }

    #[test]
    fn cap_retry_attempts_re_caps_an_already_built_config() {
        let mut sc = ServiceConfig::builder()
            .method_config(MethodConfig {
                service: None,
                method: None,
                policy: Some(retry(100)),
            })
            .build(10)
            .unwrap();

        sc.cap_retry_attempts(3).unwrap();

        match sc.method_policy("any", "any") {
            Some(MethodPolicy::Retry(r)) => assert_eq!(r.max_attempts, 3),
            _ => panic!("expected retry policy"),
        }
    }
}
