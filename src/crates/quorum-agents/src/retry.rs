//! Retry service (§4.F, agent half): merges `orca::executor::retry`'s
//! task-id-aware logging with `quorum_core::async_utils::retry::RetryPolicy`'s
//! full-jitter backoff math. Only `CoreError`s whose `ErrorCode` is
//! retryable (`AGENT_TIMEOUT`, `AGENT_RATE_LIMITED`, `AGENT_TRANSIENT`)
//! trigger another attempt.

use quorum_core::async_utils::retry::RetryPolicy;
use quorum_core::CoreError;
use std::future::Future;
use tracing::warn;

/// Default policy per §4.F: base 1s, cap 60s, 3 attempts.
pub fn default_policy() -> RetryPolicy {
    RetryPolicy::new(3)
        .with_initial_interval(1.0)
        .with_backoff_factor(2.0)
        .with_max_interval(60.0)
        .with_jitter(true)
}

/// Runs `operation`, retrying per `policy` while the returned error is
/// retryable. Calls `on_retry` once per retry (callers use this to
/// increment `TaskState.retries` and emit `task_retry`).
pub async fn with_task_retry<F, Fut, T>(
    policy: &RetryPolicy,
    task_id: &str,
    mut operation: F,
    mut on_retry: impl FnMut(usize, &CoreError),
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !error.code.is_retryable() || !policy.should_retry(attempt + 1) {
                    warn!(task_id = %task_id, attempt = attempt + 1, error = %error, "agent call failed, not retrying");
                    return Err(error);
                }
                on_retry(attempt + 1, &error);
                let delay = policy.calculate_delay(attempt);
                warn!(task_id = %task_id, attempt = attempt + 1, delay_ms = delay.as_millis(), error = %error, "agent call failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new(3).with_initial_interval(0.0).with_jitter(false);

        let result = with_task_retry(
            &policy,
            "task-1",
            || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(CoreError::new(ErrorCode::AgentTransient, "transient"))
                    } else {
                        Ok(42)
                    }
                }
            },
            |_, _| {},
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_fatal_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = default_policy();

        let result: Result<i32, CoreError> = with_task_retry(
            &policy,
            "task-2",
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(CoreError::new(ErrorCode::AgentFatal, "fatal"))
                }
            },
            |_, _| {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
