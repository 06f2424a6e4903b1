//! Backoff policies applied between attempts of the same task.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff policy controlling the delay before a retried attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// No delay between attempts.
    #[default]
    None,
    /// Fixed delay between attempts.
    Fixed { delay_ms: u64 },
    /// Exponential backoff: base * 2^attempt, capped at max.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl BackoffPolicy {
    /// Compute the delay for a given failed-attempt count (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::None => Duration::ZERO,
            BackoffPolicy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            BackoffPolicy::Exponential { base_ms, max_ms } => {
                let millis = base_ms.saturating_mul(2u64.saturating_pow(attempt as u32));
                Duration::from_millis(millis.min(*max_ms))
            }
        }
    }
}

/// Sleep before re-running a task whose previous attempt failed.
///
/// `failed_attempts` is the number of failures recorded so far; the first
/// retry waits for `delay_for_attempt(0)`.
pub async fn backoff(policy: &BackoffPolicy, failed_attempts: usize, task: usize) {
    if failed_attempts == 0 {
        return;
    }
    let delay = policy.delay_for_attempt(failed_attempts - 1);
    if delay.is_zero() {
        return;
    }
    tracing::info!(task, attempt = failed_attempts + 1, delay_ms = %delay.as_millis(), "Backing off before retry");
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed { delay_ms: 200 };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(100), Duration::from_millis(200));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base_ms: 100,
            max_ms: 500,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        // 800 capped at 500
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_millis(500));
    }

    #[test]
    fn none_backoff_zero_delay() {
        let policy = BackoffPolicy::None;
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(99), Duration::ZERO);
    }

    #[test]
    fn default_is_none() {
        assert_eq!(BackoffPolicy::default(), BackoffPolicy::None);
    }

    #[test]
    fn policy_deserializes_from_tagged_json() {
        let policy: BackoffPolicy =
            serde_json::from_str(r#"{"kind":"exponential","base_ms":250,"max_ms":4000}"#).unwrap();
        assert_eq!(
            policy,
            BackoffPolicy::Exponential {
                base_ms: 250,
                max_ms: 4000
            }
        );
        let none: BackoffPolicy = serde_json::from_str(r#"{"kind":"none"}"#).unwrap();
        assert_eq!(none, BackoffPolicy::None);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_for_policy_delay() {
        let policy = BackoffPolicy::Fixed { delay_ms: 1_000 };
        let start = tokio::time::Instant::now();
        backoff(&policy, 1, 0).await;
        assert_eq!(start.elapsed(), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn no_backoff_before_first_attempt() {
        let policy = BackoffPolicy::Fixed { delay_ms: 1_000 };
        let start = tokio::time::Instant::now();
        backoff(&policy, 0, 0).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
