//! Retry utilities for operations against an eventually-consistent cluster.
//!
//! Two families live here:
//!
//! - Deadline-bounded polling ([`poll`], [`poll_value`], [`poll_with_observer`],
//!   [`spawn_poll`]): retries at a fixed interval until the operation succeeds
//!   or the [`RunContext`] expires. On expiry the returned [`Error::Timeout`]
//!   carries every attempt's failure.
//! - Attempt-bounded backoff ([`retry_with_backoff`]): exponential backoff with
//!   jitter for one-off API calls such as discovery.
//!
//! Both stop early on an error that is not [retryable](Error::is_retryable).
//!
//! # Example
//!
//! ```ignore
//! use testbed_common::retry::poll_value;
//!
//! let secret = poll_value(&ctx, "fetch kubeconfig", Duration::from_secs(10), || async {
//!     store.get(&secret_ref).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::context::RunContext;
use crate::Error;

/// One failed attempt, as reported to a poll observer
#[derive(Debug)]
pub struct AttemptFailure<'a> {
    /// 1-based attempt number
    pub attempt: u32,
    /// Why the attempt failed
    pub error: &'a Error,
}

/// Poll `operation` every `interval` until it succeeds or `ctx` is done.
pub async fn poll<F, Fut>(
    ctx: &RunContext,
    operation_name: &str,
    interval: Duration,
    operation: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    poll_with_observer(ctx, operation_name, interval, operation, |_| {}).await
}

/// Poll `operation` every `interval` until it yields a value or `ctx` is done.
pub async fn poll_value<T, F, Fut>(
    ctx: &RunContext,
    operation_name: &str,
    interval: Duration,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    poll_with_observer(ctx, operation_name, interval, operation, |_| {}).await
}

/// Poll `operation` every `interval`, reporting each failed attempt to
/// `observer`.
///
/// The operation always runs at least once. An error that is not
/// [retryable](Error::is_retryable) is returned as is, straight away. After
/// any other failure the loop sleeps for `interval`; if the context finishes
/// during that sleep the loop stops with [`Error::Timeout`]. When the deadline falls exactly on an attempt
/// boundary the attempt still runs, so an operation that never succeeds is
/// tried `floor(deadline / interval) + 1` times.
pub async fn poll_with_observer<T, F, Fut, O>(
    ctx: &RunContext,
    operation_name: &str,
    interval: Duration,
    mut operation: F,
    mut observer: O,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    O: FnMut(AttemptFailure<'_>),
{
    let mut failures = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "Attempt failed, polling again"
                );
                observer(AttemptFailure {
                    attempt,
                    error: &e,
                });
                if !e.is_retryable() {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Attempt failed with a fatal error, not polling again"
                    );
                    return Err(e);
                }
                failures.push(e);
            }
        }

        // Biased towards the timer so an attempt scheduled exactly at the
        // deadline still runs.
        tokio::select! {
            biased;
            _ = tokio::time::sleep(interval) => {}
            _ = ctx.done() => {
                warn!(
                    operation = %operation_name,
                    attempts = attempt,
                    "Polling gave up at deadline"
                );
                return Err(Error::timeout(operation_name, failures));
            }
        }
    }
}

/// Handle to a poll running on its own task.
///
/// Awaiting the handle yields the poll's single result. Attempt-level
/// telemetry is delivered through the observer passed to [`spawn_poll`], so
/// nothing blocks if the caller never awaits. Dropping the handle cancels the
/// poll at its next yield point.
#[derive(Debug)]
pub struct PollHandle<T> {
    task: JoinHandle<Result<T, Error>>,
    ctx: RunContext,
}

impl<T> PollHandle<T> {
    /// Stop polling; the handle then resolves to [`Error::Timeout`]
    pub fn cancel(&self) {
        self.ctx.cancel();
    }
}

impl<T> Future for PollHandle<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| {
                Err(Error::internal_with_context(
                    "spawn_poll",
                    format!("poll task failed: {e}"),
                ))
            })
        })
    }
}

impl<T> Drop for PollHandle<T> {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

/// Run [`poll_with_observer`] on a background task.
///
/// The task gets a child of `ctx`, so [`PollHandle::cancel`] stops only this
/// poll while cancelling `ctx` stops it too.
pub fn spawn_poll<T, F, Fut, O>(
    ctx: &RunContext,
    operation_name: impl Into<String>,
    interval: Duration,
    operation: F,
    observer: O,
) -> PollHandle<T>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, Error>> + Send + 'static,
    O: FnMut(AttemptFailure<'_>) + Send + 'static,
{
    let ctx = ctx.child();
    let task_ctx = ctx.clone();
    let operation_name = operation_name.into();
    let task = tokio::spawn(async move {
        poll_with_observer(&task_ctx, &operation_name, interval, operation, observer).await
    });
    PollHandle { task, ctx }
}

/// Attempt-bounded schedule for [`retry_with_backoff`]
///
/// The delay before retry `n` is `first_delay * 2^(n-1)`, capped at
/// `max_delay` and jittered to between half and one and a half times that.
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Total attempts; at least one is always made
    pub attempts: u32,
    /// Delay before the first retry
    pub first_delay: Duration,
    /// Cap on any single delay before jitter
    pub max_delay: Duration,
}

impl Backoff {
    /// A schedule of `attempts` tries starting at `first_delay`
    pub fn new(attempts: u32, first_delay: Duration, max_delay: Duration) -> Self {
        Self {
            attempts,
            first_delay,
            max_delay,
        }
    }

    fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.first_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn jittered_delay(&self, retry: u32) -> Duration {
        self.base_delay(retry)
            .mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(100), Duration::from_secs(30))
    }
}

/// Retry `operation` on the [`Backoff`] schedule.
///
/// Stops at the first success, at the first error that is not
/// [retryable](Error::is_retryable), or when attempts run out; the last two
/// return the error that stopped the loop. If `ctx` finishes while waiting
/// between attempts the result is [`Error::Timeout`] carrying every failure.
pub async fn retry_with_backoff<T, F, Fut>(
    ctx: &RunContext,
    backoff: &Backoff,
    operation_name: &str,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let attempts = backoff.attempts.max(1);
    let mut failures = Vec::new();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if attempt >= attempts || !e.is_retryable() {
            error!(
                operation = %operation_name,
                attempt = attempt,
                retryable = e.is_retryable(),
                error = %e,
                "Operation failed, giving up"
            );
            return Err(e);
        }

        let delay = backoff.jittered_delay(attempt);
        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = delay.as_millis() as u64,
            "Operation failed, backing off"
        );
        failures.push(e);

        tokio::select! {
            biased;
            _ = ctx.done() => return Err(Error::timeout(operation_name, failures)),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
