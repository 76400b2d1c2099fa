//! Bounded polling with linear backoff, an optional overall deadline and a
//! cancellation token.

use std::future::Future;
use std::time::Duration;

use metrics::counter;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep after check `n` is `n * step`.
    pub step: Duration,
    /// Number of check/sleep rounds before one last check.
    pub max_attempts: u32,
    /// Overall bound across all rounds, if any.
    pub deadline: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self { step: Duration::from_secs(10), max_attempts: 10, deadline: None }
    }
}

impl PollPolicy {
    /// Defaults overridden by `OBS_DRAIN_POLL_SECS` / `OBS_DRAIN_MAX_ATTEMPTS`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let step = std::env::var("OBS_DRAIN_POLL_SECS").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.step);
        let max_attempts = std::env::var("OBS_DRAIN_MAX_ATTEMPTS").ok().and_then(|s| s.parse::<u32>().ok()).unwrap_or(d.max_attempts);
        Self { step, max_attempts, deadline: None }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration { self.step * attempt }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("condition not met after {0} checks")]
    Exhausted(u32),
    #[error("deadline of {deadline:?} exceeded after {checks} checks")]
    DeadlineExceeded { deadline: Duration, checks: u32 },
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Check(#[from] anyhow::Error),
}

/// Run `check` until it returns `true`. Returns the number of checks made.
pub async fn poll_until<F, Fut>(policy: &PollPolicy, cancel: &CancellationToken, mut check: F) -> Result<u32, PollError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = policy.deadline.map(|d| (Instant::now() + d, d));
    let mut checks = 0u32;
    for attempt in 1..=policy.max_attempts + 1 {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        checks += 1;
        counter!("upgrade_drain_polls", 1u64);
        if check(attempt).await? {
            return Ok(checks);
        }
        if attempt > policy.max_attempts {
            break;
        }
        let mut wait = policy.delay(attempt);
        if let Some((at, total)) = deadline {
            let now = Instant::now();
            if now >= at {
                return Err(PollError::DeadlineExceeded { deadline: total, checks });
            }
            wait = wait.min(at - now);
        }
        debug!(attempt, wait_ms = wait.as_millis() as u64, "condition not met; backing off");
        tokio::select! {
            _ = cancel.cancelled() => return Err(PollError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
    Err(PollError::Exhausted(checks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> PollPolicy {
        PollPolicy { step: Duration::from_millis(1), max_attempts, deadline: None }
    }

    #[test]
    fn backoff_is_linear() {
        let p = PollPolicy::default();
        assert_eq!(p.delay(1), Duration::from_secs(10));
        assert_eq!(p.delay(10), Duration::from_secs(100));
    }

    #[tokio::test]
    async fn returns_once_condition_holds() {
        let seen = AtomicU32::new(0);
        let n = poll_until(&fast(10), &CancellationToken::new(), |_| {
            let c = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok(c >= 3) }
        })
        .await
        .expect("condition met");
        assert_eq!(n, 3);
    }

    #[tokio::test]
    async fn exhausts_after_bound_plus_final_check() {
        let err = poll_until(&fast(3), &CancellationToken::new(), |_| async { Ok(false) }).await.unwrap_err();
        assert!(matches!(err, PollError::Exhausted(4)), "{err}");
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let policy = PollPolicy { step: Duration::from_secs(3600), max_attempts: 10, deadline: None };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(Duration::from_secs(5), poll_until(&policy, &cancel, |_| async { Ok(false) }))
            .await
            .expect("poll did not stop")
            .unwrap_err();
        assert!(matches!(err, PollError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_caps_total_wait() {
        let policy = PollPolicy { step: Duration::from_secs(3600), max_attempts: 10, deadline: Some(Duration::from_millis(30)) };
        let err = tokio::time::timeout(Duration::from_secs(5), poll_until(&policy, &CancellationToken::new(), |_| async { Ok(false) }))
            .await
            .expect("deadline ignored")
            .unwrap_err();
        // Hour-long steps are capped by the deadline: one check, a short sleep, one more check.
        assert!(matches!(err, PollError::DeadlineExceeded { checks: 2, .. }), "{err}");
    }

    #[tokio::test]
    async fn check_errors_propagate() {
        let err = poll_until(&fast(3), &CancellationToken::new(), |_| async { Err(anyhow::anyhow!("list failed")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "list failed");
    }
}
