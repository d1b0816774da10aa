//! Generic backoff/retry executor shared by the Credential Resolver (C1
//! OAuth refresh), the Event Publisher (C4 publish retry), and the
//! Orchestrator (C9 step retry).
//!
//! Grounded on the jitter idiom in the teacher's
//! `flow_engine::schedule_step` (`rand::thread_rng().gen_range(-variance..=
//! variance)`) and the exponential-backoff-with-jitter shape in
//! `nebula-credential::manager::core::calculate_backoff`.

use std::time::Duration;

use rand::Rng;

use crate::models::{BackoffKind, BackoffPolicy, RetryPolicy};

/// Computes the delay before attempt `attempt` (1-indexed: the delay before
/// the *second* attempt is `attempt = 1`).
pub fn backoff_delay(policy: &BackoffPolicy, attempt: u32) -> Duration {
    match policy.kind {
        BackoffKind::Fixed => policy.delay,
        BackoffKind::Exponential => {
            let millis = policy.delay.as_millis() as u64;
            let scaled = millis.saturating_mul(1u64 << attempt.min(20));
            Duration::from_millis(scaled)
        }
    }
}

/// Adds +/-25% jitter to a base delay, matching the teacher's
/// `gen_range(-variance..=variance)` pattern (variance = 25% of base here).
pub fn with_jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as i64;
    if millis <= 0 {
        return base;
    }
    let variance = millis / 4;
    let jitter = if variance > 0 {
        rand::thread_rng().gen_range(-variance..=variance)
    } else {
        0
    };
    Duration::from_millis((millis + jitter).max(0) as u64)
}

/// Runs `op` up to `policy.max_attempts` times, sleeping the configured
/// backoff between attempts. Returns the last error if every attempt fails.
/// `on_retry` is invoked once per retry (not on the first attempt) with the
/// zero-indexed attempt number that just failed, for retry-count metrics.
pub async fn retry_with_policy<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    mut on_retry: impl FnMut(u32),
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e);
                }
                on_retry(attempt);
                let delay = with_jitter(backoff_delay(&policy.backoff, attempt - 1));
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Simple fixed-attempt-count exponential retry used by the Event Publisher:
/// `2^n * 1s` up to `max_attempts`, dropping the event after exhaustion
/// (spec §4.4).
pub async fn retry_fire_and_forget<F, Fut>(max_attempts: u32, mut op: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for n in 0..max_attempts {
        if op().await {
            return true;
        }
        if n + 1 < max_attempts {
            tokio::time::sleep(Duration::from_secs(1u64 << n)).await;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Fixed,
            delay: Duration::from_secs(5),
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(5));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(5));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = BackoffPolicy {
            kind: BackoffKind::Exponential,
            delay: Duration::from_secs(3),
        };
        assert_eq!(backoff_delay(&policy, 0), Duration::from_secs(3));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(6));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn retry_with_policy_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy {
                kind: BackoffKind::Fixed,
                delay: Duration::from_millis(1),
            },
        };
        let mut calls = 0;
        let mut retries = 0;
        let result: Result<(), &str> = retry_with_policy(
            &policy,
            || {
                calls += 1;
                async { Err("boom") }
            },
            |_| retries += 1,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn retry_with_policy_succeeds_without_retry_callback_on_first_try() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: BackoffPolicy {
                kind: BackoffKind::Fixed,
                delay: Duration::from_millis(1),
            },
        };
        let mut retries = 0;
        let result: Result<i32, &str> =
            retry_with_policy(&policy, || async { Ok(42) }, |_| retries += 1).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(retries, 0);
    }
}
