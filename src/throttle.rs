//! Throttling Policy (C8, spec §4.8): a pure lookup table from step type
//! (and criticality) to `{concurrency, rateLimit, retry}`.

use std::time::Duration;

use crate::models::{BackoffKind, BackoffPolicy, RateLimit, RetryPolicy, StepType, ThrottlingPolicy};

fn exponential(base: Duration, max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffPolicy {
            kind: BackoffKind::Exponential,
            delay: base,
        },
    }
}

fn fixed(delay: Duration, max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: BackoffPolicy {
            kind: BackoffKind::Fixed,
            delay,
        },
    }
}

/// Pure function `policyFor(step) -> ThrottlingPolicy` per the table in spec
/// §4.8. `critical` mirrors `FlowStep::is_critical()`.
pub fn policy_for(step_type: &StepType, critical: bool) -> ThrottlingPolicy {
    match step_type {
        StepType::HttpRequest | StepType::OauthApiCall => {
            if critical {
                ThrottlingPolicy {
                    concurrency: Some(2),
                    rate_limit: Some(RateLimit {
                        max: 10,
                        per: Duration::from_secs(10),
                    }),
                    retry: Some(exponential(Duration::from_secs(3), 5)),
                }
            } else {
                ThrottlingPolicy {
                    concurrency: Some(5),
                    rate_limit: Some(RateLimit {
                        max: 10,
                        per: Duration::from_secs(10),
                    }),
                    retry: Some(exponential(Duration::from_secs(3), 3)),
                }
            }
        }
        StepType::SandboxSync | StepType::SandboxAsync | StepType::CodeExecution => ThrottlingPolicy {
            concurrency: Some(3),
            rate_limit: Some(RateLimit {
                max: 20,
                per: Duration::from_secs(30),
            }),
            retry: Some(fixed(Duration::from_secs(5), 2)),
        },
        StepType::DataTransform | StepType::Conditional => ThrottlingPolicy {
            concurrency: Some(15),
            rate_limit: Some(RateLimit {
                max: 50,
                per: Duration::from_secs(30),
            }),
            retry: Some(fixed(Duration::from_secs(1), 2)),
        },
        StepType::Delay => ThrottlingPolicy {
            concurrency: None,
            rate_limit: None,
            retry: None,
        },
        StepType::Unknown(_) => ThrottlingPolicy {
            concurrency: Some(2),
            rate_limit: Some(RateLimit {
                max: 5,
                per: Duration::from_secs(30),
            }),
            retry: Some(fixed(Duration::from_secs(5), 1)),
        },
    }
}

/// Global defaults applied when the runtime consults no per-step policy
/// (spec §4.8): concurrency 10, 100/60s, exponential base 2s up to 3
/// attempts.
pub fn global_default_policy() -> ThrottlingPolicy {
    ThrottlingPolicy {
        concurrency: Some(10),
        rate_limit: Some(RateLimit {
            max: 100,
            per: Duration::from_secs(60),
        }),
        retry: Some(exponential(Duration::from_secs(2), 3)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_http_gets_tighter_concurrency_and_more_retries() {
        let critical = policy_for(&StepType::HttpRequest, true);
        let non_critical = policy_for(&StepType::HttpRequest, false);
        assert_eq!(critical.concurrency, Some(2));
        assert_eq!(non_critical.concurrency, Some(5));
        assert_eq!(critical.retry.unwrap().max_attempts, 5);
        assert_eq!(non_critical.retry.unwrap().max_attempts, 3);
    }

    #[test]
    fn delay_has_no_policy() {
        let policy = policy_for(&StepType::Delay, true);
        assert!(policy.concurrency.is_none());
        assert!(policy.rate_limit.is_none());
        assert!(policy.retry.is_none());
    }

    #[test]
    fn unknown_step_type_gets_conservative_policy() {
        let policy = policy_for(&StepType::Unknown("made_up".to_string()), true);
        assert_eq!(policy.concurrency, Some(2));
        assert_eq!(policy.retry.unwrap().max_attempts, 1);
    }

    #[test]
    fn sandbox_and_data_transform_use_fixed_backoff() {
        let sandbox = policy_for(&StepType::SandboxSync, true);
        assert!(matches!(
            sandbox.retry.unwrap().backoff.kind,
            BackoffKind::Fixed
        ));
        let transform = policy_for(&StepType::DataTransform, true);
        assert!(matches!(
            transform.retry.unwrap().backoff.kind,
            BackoffKind::Fixed
        ));
    }
}
