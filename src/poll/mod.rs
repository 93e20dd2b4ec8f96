//! Retry-until-success polling used to decide when an asynchronous side
//! effect of the function host has happened.
//!
//! A probe is re-invoked every `poll_interval` until it succeeds or the
//! policy's `timeout` has elapsed. The diagnostic message describing what was
//! awaited is only built when the poll fails.
//!
//! A successful check may be observed up to one interval after the external
//! state changed. Each attempt is cut off at the deadline and the last sleep
//! is shortened to end there, so a slow check cannot push a timeout past the
//! configured bound.

pub mod retry;

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Timeout and interval for a single verification call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Both durations must be non-zero.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Result<Self, String> {
        if timeout.is_zero() {
            return Err("poll timeout must be positive".to_string());
        }
        if poll_interval.is_zero() {
            return Err("poll interval must be positive".to_string());
        }
        Ok(Self {
            timeout,
            poll_interval,
        })
    }

    pub fn from_millis(timeout_ms: u64, poll_interval_ms: u64) -> Result<Self, String> {
        Self::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(poll_interval_ms),
        )
    }

    /// Same interval, different timeout. Zero keeps the current timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Bookkeeping of a successful poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollSuccess {
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    /// The probe never succeeded within the policy timeout.
    Timeout {
        message: String,
        attempts: u32,
        elapsed: Duration,
    },
    /// The poll was cancelled from outside, usually by fixture teardown.
    Cancelled {
        message: String,
        attempts: u32,
        elapsed: Duration,
    },
}

impl PollError {
    pub fn message(&self) -> &str {
        match self {
            PollError::Timeout { message, .. } | PollError::Cancelled { message, .. } => message,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            PollError::Timeout { attempts, .. } | PollError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

impl std::fmt::Display for PollError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollError::Timeout {
                message,
                attempts,
                elapsed,
            } => write!(
                f,
                "timed out after {}ms ({} attempts): {}",
                elapsed.as_millis(),
                attempts,
                message
            ),
            PollError::Cancelled {
                message,
                attempts,
                elapsed,
            } => write!(
                f,
                "cancelled after {}ms ({} attempts): {}",
                elapsed.as_millis(),
                attempts,
                message
            ),
        }
    }
}

impl std::error::Error for PollError {}

/// Poll `probe` until it returns `true`.
pub async fn wait_until<P, Fut, M>(
    policy: &RetryPolicy,
    mut probe: P,
    message: M,
) -> Result<PollSuccess, PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    M: FnOnce() -> String,
{
    let probe = move || {
        let check = probe();
        async move { check.await.then_some(()) }
    };
    run(policy, None, probe, message)
        .await
        .map(|((), success)| success)
}

/// Like [`wait_until`], but also exits when `cancel` fires.
pub async fn wait_until_cancellable<P, Fut, M>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut probe: P,
    message: M,
) -> Result<PollSuccess, PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    M: FnOnce() -> String,
{
    let probe = move || {
        let check = probe();
        async move { check.await.then_some(()) }
    };
    run(policy, Some(cancel), probe, message)
        .await
        .map(|((), success)| success)
}

/// Poll `probe` until it yields a value.
pub async fn wait_for<T, P, Fut, M>(
    policy: &RetryPolicy,
    probe: P,
    message: M,
) -> Result<(T, PollSuccess), PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
    M: FnOnce() -> String,
{
    run(policy, None, probe, message).await
}

/// Like [`wait_for`], but also exits when `cancel` fires.
pub async fn wait_for_cancellable<T, P, Fut, M>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    probe: P,
    message: M,
) -> Result<(T, PollSuccess), PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
    M: FnOnce() -> String,
{
    run(policy, Some(cancel), probe, message).await
}

async fn run<T, P, Fut, M>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    mut probe: P,
    message: M,
) -> Result<(T, PollSuccess), PollError>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
    M: FnOnce() -> String,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(PollError::Cancelled {
                message: message(),
                attempts,
                elapsed: start.elapsed(),
            });
        }

        attempts += 1;
        // An attempt still running at the deadline counts as failed.
        let remaining = deadline.saturating_duration_since(Instant::now());
        let attempt = tokio::time::timeout(remaining, probe());
        let outcome = match cancel {
            Some(token) => tokio::select! {
                outcome = attempt => outcome,
                _ = token.cancelled() => {
                    return Err(PollError::Cancelled {
                        message: message(),
                        attempts,
                        elapsed: start.elapsed(),
                    });
                }
            },
            None => attempt.await,
        };

        match outcome {
            Ok(Some(value)) => {
                let elapsed = start.elapsed();
                debug!(
                    attempts,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "probe succeeded"
                );
                return Ok((value, PollSuccess { attempts, elapsed }));
            }
            Ok(None) => {}
            Err(_) => debug!(attempt = attempts, "attempt cut off at deadline"),
        }

        let elapsed = start.elapsed();
        if elapsed >= policy.timeout {
            let message = message();
            warn!(
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                %message,
                "poll timed out"
            );
            return Err(PollError::Timeout {
                message,
                attempts,
                elapsed,
            });
        }

        // The last sleep ends at the deadline, leaving room for a final check.
        let pause = policy
            .poll_interval
            .min(deadline.saturating_duration_since(Instant::now()));
        debug!(
            attempt = attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            pause_ms = pause.as_millis() as u64,
            "probe not yet satisfied"
        );

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = token.cancelled() => {}
                }
            }
            None => tokio::time::sleep(pause).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(timeout_ms: u64, interval_ms: u64) -> RetryPolicy {
        RetryPolicy::from_millis(timeout_ms, interval_ms).unwrap()
    }

    #[test]
    fn rejects_zero_durations() {
        assert!(RetryPolicy::from_millis(0, 100).is_err());
        assert!(RetryPolicy::from_millis(100, 0).is_err());
        assert!(RetryPolicy::from_millis(100, 100).is_ok());
    }

    #[test]
    fn with_timeout_ignores_zero() {
        let p = policy(1000, 100).with_timeout(Duration::ZERO);
        assert_eq!(p.timeout(), Duration::from_millis(1000));
        let p = p.with_timeout(Duration::from_secs(5));
        assert_eq!(p.timeout(), Duration::from_secs(5));
        assert_eq!(p.poll_interval(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_success_does_not_sleep_or_build_message() {
        let messages = AtomicU32::new(0);
        let start = Instant::now();

        let result = wait_until(
            &policy(1000, 500),
            || async { true },
            || {
                messages.fetch_add(1, Ordering::SeqCst);
                "unused".to_string()
            },
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(messages.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn never_true_times_out_within_one_interval_of_bound() {
        let messages = AtomicU32::new(0);
        let start = Instant::now();

        let err = wait_until(
            &policy(1000, 500),
            || async { false },
            || {
                messages.fetch_add(1, Ordering::SeqCst);
                "waiting for flag".to_string()
            },
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(err.is_timeout());
        assert_eq!(err.message(), "waiting for flag");
        assert_eq!(messages.load(Ordering::SeqCst), 1);
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn false_n_times_then_true_makes_n_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let probe_calls = calls.clone();

        let result = wait_until(
            &policy(10_000, 100),
            move || {
                let n = probe_calls.fetch_add(1, Ordering::SeqCst);
                async move { n >= 4 }
            },
            || "never built".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn flag_flipped_externally_is_observed_within_one_interval() {
        let flag = Arc::new(AtomicBool::new(false));
        let writer = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2000)).await;
            writer.store(true, Ordering::SeqCst);
        });

        let start = Instant::now();
        let reader = flag.clone();
        let result = wait_until(
            &policy(10_000, 500),
            move || {
                let reader = reader.clone();
                async move { reader.load(Ordering::SeqCst) }
            },
            || "flag never flipped".to_string(),
        )
        .await
        .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(2000), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(2500), "{elapsed:?}");
        assert_eq!(result.elapsed, elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_polls_on_unchanged_state_agree() {
        let p = policy(300, 100);
        let first = wait_until(&p, || async { false }, || "a".to_string()).await;
        let second = wait_until(&p, || async { false }, || "a".to_string()).await;
        assert!(first.unwrap_err().is_timeout());
        assert!(second.unwrap_err().is_timeout());

        assert!(wait_until(&p, || async { true }, String::new).await.is_ok());
        assert!(wait_until(&p, || async { true }, String::new).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_returns_first_value() {
        let calls = AtomicU32::new(0);
        let (value, success) = wait_for(
            &policy(5000, 100),
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { (n == 2).then(|| format!("message-{n}")) }
            },
            || "no message".to_string(),
        )
        .await
        .unwrap();

        assert_eq!(value, "message-2");
        assert_eq!(success.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_poll_early() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = wait_until_cancellable(
            &policy(60_000, 100),
            &token,
            || async { false },
            || "output queue".to_string(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Cancelled { .. }));
        assert_eq!(err.message(), "output queue");
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test]
    async fn already_cancelled_token_skips_probe() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicU32::new(0);

        let err = wait_for_cancellable(
            &policy(1000, 100),
            &token,
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Some(()) }
            },
            || "teardown".to_string(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_is_cut_off_at_deadline() {
        let start = Instant::now();
        let err = wait_until(
            &policy(1000, 500),
            || async {
                tokio::time::sleep(Duration::from_millis(800)).await;
                false
            },
            || "slow storage".to_string(),
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 2);
        assert!(elapsed >= Duration::from_millis(1000), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_still_times_out() {
        let start = Instant::now();
        let err = wait_for(
            &policy(2000, 100),
            || std::future::pending::<Option<()>>(),
            || "host never answers".to_string(),
        )
        .await
        .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 1);
        assert!(start.elapsed() <= Duration::from_millis(2100));
    }

    #[tokio::test(start_paused = true)]
    async fn final_check_lands_on_deadline() {
        let calls = AtomicU32::new(0);
        let err = wait_until(
            &policy(1000, 400),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { false }
            },
            || "flag".to_string(),
        )
        .await
        .unwrap_err();

        // 0, 400, 800, then the shortened pause ends at 1000.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_running_attempt() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let err = wait_until_cancellable(
            &policy(60_000, 100),
            &token,
            || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                false
            },
            || "queue read".to_string(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PollError::Cancelled { attempts: 1, .. }));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn timeout_display_names_awaited_thing() {
        let err = PollError::Timeout {
            message: "message abc on queue test-output".to_string(),
            attempts: 3,
            elapsed: Duration::from_millis(1200),
        };
        assert_eq!(
            err.to_string(),
            "timed out after 1200ms (3 attempts): message abc on queue test-output"
        );
    }
}
