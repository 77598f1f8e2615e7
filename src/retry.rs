//! Backoff configuration and the context-aware retry loop.
//!
//! This module provides the [`BackoffPolicy`] type and the [`call`] helper
//! used by [`Topic`](crate::Topic) and [`Subscription`](crate::Subscription)
//! to retry driver calls that fail with errors the driver marks as
//! retryable.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which the supplied predicate returns `true`
//! - Uses exponential backoff with randomized jitter to prevent thundering herd
//! - Caps delay at `max_delay` to prevent excessive wait times
//! - Never gives up on its own: the caller bounds the loop through the
//!   [`Context`] it passes in

use std::collections::hash_map::RandomState;
use std::fmt;
use std::future::Future;
use std::hash::BuildHasher;
use std::time::Duration;

use serde::Deserialize;

use crate::{Context, ContextError};

/// Exponential backoff parameters.
///
/// Each [`call`] invocation builds its own [`ExponentialBackoff`] from the
/// policy, so the pause state is never shared between calls.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// Example: 2.0 doubles the delay each time (exponential backoff).
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retry attempts (caps exponential growth).
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    /// Reasonable default backoff.
    ///
    /// - `multiplier`: 2.0 (exponential backoff)
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Start a fresh backoff sequence.
    pub fn start(&self) -> ExponentialBackoff {
        // ---
        ExponentialBackoff {
            policy: self.clone(),
            current: self.initial_delay,
            retries: 0,
        }
    }
}

/// Source of pauses between attempts.
pub trait Backoff: Send {
    /// Duration to wait before the next attempt.
    fn pause(&mut self) -> Duration;
}

/// Backoff state for a single retry loop.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
    retries: u32,
}

impl ExponentialBackoff {
    /// How many pauses have been handed out so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Backoff for ExponentialBackoff {
    fn pause(&mut self) -> Duration {
        // ---
        let max_delay = self.policy.max_delay;
        let pause = apply_jitter(self.current).min(max_delay);

        // Overflowing or non-finite growth saturates at the cap.
        let grown = self.current.as_secs_f64() * f64::from(self.policy.multiplier.max(1.0));
        self.current = Duration::try_from_secs_f64(grown)
            .unwrap_or(max_delay)
            .min(max_delay);
        self.retries += 1;

        pause
    }
}

/// Why [`call`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// `f` returned an error the predicate classified as not retryable.
    Failed(E),

    /// The context finished before `f` succeeded.
    ///
    /// `func_err` is the last error returned by `f`, or `None` if `f` was
    /// never invoked.
    Context {
        ctx_err: ContextError,
        func_err: Option<E>,
    },
}

impl<E> RetryError<E> {
    /// The last error returned by the retried function, if any.
    pub fn into_func_err(self) -> Option<E> {
        // ---
        match self {
            RetryError::Failed(err) => Some(err),
            RetryError::Context { func_err, .. } => func_err,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        match self {
            RetryError::Failed(err) => err.fmt(f),
            RetryError::Context {
                ctx_err,
                func_err: Some(err),
            } => write!(f, "{ctx_err}; last error: {err}"),
            RetryError::Context {
                ctx_err,
                func_err: None,
            } => write!(f, "{ctx_err}; last error: <nil>"),
        }
    }
}

impl<E> std::error::Error for RetryError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        // ---
        match self {
            RetryError::Failed(err) => err.source(),
            RetryError::Context { ctx_err, .. } => Some(ctx_err),
        }
    }
}

/// Call `f` until it succeeds, fails permanently, or `ctx` is done.
///
/// - If `ctx` is already done on entry, `f` is never invoked.
/// - `Ok` from `f` is returned immediately.
/// - An error for which `is_retryable` is `false` is returned immediately,
///   without sleeping.
/// - A retryable error causes a sleep of `backoff.pause()`; if `ctx`
///   finishes during the sleep, the context error and the last function
///   error are returned together.
///
/// # Example
///
/// ```ignore
/// let ids = retry::call(&ctx, &mut policy.start(), |e| driver.is_retryable(e), || {
///     driver.receive_batch(&ctx, 10)
/// })
/// .await?;
/// ```
pub async fn call<T, E, B, R, F, Fut>(
    ctx: &Context,
    backoff: &mut B,
    is_retryable: R,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    B: Backoff + ?Sized,
    R: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    // Do nothing if context is done on entry.
    if let Some(ctx_err) = ctx.err() {
        return Err(RetryError::Context {
            ctx_err,
            func_err: None,
        });
    }

    loop {
        let err = match f().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(RetryError::Failed(err));
        }

        let pause = backoff.pause();
        crate::log_debug!("retryable failure, waiting {:?} before next attempt", pause);

        if let Err(ctx_err) = ctx.sleep(pause).await {
            return Err(RetryError::Context {
                ctx_err,
                func_err: Some(err),
            });
        }
    }
}

/// Apply ±25% jitter to a duration to prevent thundering herd.
///
/// Uses a simple multiplicative jitter: `delay * (0.75 + random(0.0..0.5))`
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let random_state = RandomState::new();
    let hash = random_state.hash_one(std::time::SystemTime::now());

    // Convert to 0.0..1.0 range
    let random_factor = (hash % 1000) as f64 / 1000.0;

    let jitter_multiplier = 0.75 + (random_factor * 0.5);

    Duration::try_from_secs_f64(delay.as_secs_f64() * jitter_multiplier).unwrap_or(delay)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    fn transient(err: &TestError) -> bool {
        *err == TestError::Transient
    }

    /// Counts pauses without sleeping for real.
    struct CountingBackoff {
        pauses: Arc<AtomicUsize>,
        pause: Duration,
    }

    impl Backoff for CountingBackoff {
        fn pause(&mut self) -> Duration {
            self.pauses.fetch_add(1, Ordering::SeqCst);
            self.pause
        }
    }

    fn counting(pause: Duration) -> (CountingBackoff, Arc<AtomicUsize>) {
        // ---
        let pauses = Arc::new(AtomicUsize::new(0));
        (
            CountingBackoff {
                pauses: pauses.clone(),
                pause,
            },
            pauses,
        )
    }

    #[tokio::test]
    async fn test_no_retry_on_success() {
        // ---
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let (mut backoff, pauses) = counting(Duration::from_millis(10));

        let result = call(&ctx, &mut backoff, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pauses.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_before_call_never_invokes_f() {
        // ---
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();

        let calls = AtomicUsize::new(0);
        let (mut backoff, _) = counting(Duration::from_millis(10));

        let result = call(&ctx, &mut backoff, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, TestError>(()) }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryError::Context {
                ctx_err: ContextError::Canceled,
                func_err: None,
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_no_sleep_on_non_retryable_error() {
        // ---
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let (mut backoff, pauses) = counting(Duration::from_secs(3600));
        let start = std::time::Instant::now();

        let result = call(&ctx, &mut backoff, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Fatal) }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Failed(TestError::Fatal))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(pauses.load(Ordering::SeqCst), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        // ---
        let ctx = Context::background();
        let calls = AtomicUsize::new(0);
        let (mut backoff, pauses) = counting(Duration::from_millis(10));

        let result = call(&ctx, &mut backoff, transient, || {
            let attempt = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(pauses.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep_reports_last_error() {
        // ---
        let ctx = Context::background().with_timeout(Duration::from_millis(250));
        let calls = AtomicUsize::new(0);
        let (mut backoff, _) = counting(Duration::from_millis(100));

        let result = call(&ctx, &mut backoff, transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError::Transient) }
        })
        .await;

        match result {
            Err(RetryError::Context { ctx_err, func_err }) => {
                assert_eq!(ctx_err, ContextError::DeadlineExceeded);
                assert_eq!(func_err, Some(TestError::Transient));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        // ---
        let policy = BackoffPolicy {
            multiplier: 10.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        };
        let mut backoff = policy.start();

        for _ in 0..10 {
            assert!(backoff.pause() <= Duration::from_millis(50));
        }
        assert_eq!(backoff.retries(), 10);
    }

    #[test]
    fn test_extreme_policies_saturate_at_max_delay() {
        // ---
        let policies = [
            BackoffPolicy {
                multiplier: 1e30,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::MAX,
            },
            BackoffPolicy {
                multiplier: f32::INFINITY,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
            },
            BackoffPolicy {
                multiplier: f32::NAN,
                initial_delay: Duration::MAX,
                max_delay: Duration::MAX,
            },
        ];

        for policy in policies {
            let mut backoff = policy.start();
            for _ in 0..5 {
                assert!(backoff.pause() <= policy.max_delay, "{policy:?}");
            }
            assert_eq!(backoff.retries(), 5);
        }
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);

        for _ in 0..100 {
            let jittered = apply_jitter(delay);

            // Should be 75ms..125ms (±25%)
            assert!(
                jittered >= Duration::from_millis(75),
                "jitter too low: {jittered:?}",
            );
            assert!(
                jittered <= Duration::from_millis(125),
                "jitter too high: {jittered:?}",
            );
        }
    }

    #[test]
    fn test_context_error_display() {
        // ---
        let err: RetryError<std::io::Error> = RetryError::Context {
            ctx_err: ContextError::Canceled,
            func_err: None,
        };
        assert_eq!(err.to_string(), "context canceled; last error: <nil>");
    }
}
