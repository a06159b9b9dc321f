//! Bounded retries and caller deadlines for provider and store calls.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use vassago_core::{Error, Result, Stage};

/// Retry policy for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize backoff delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff after failed attempt number `attempt` (1-based).
    ///
    /// With jitter the delay is drawn uniformly from the upper half of the window.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let window = self
            .base_delay_ms
            .saturating_mul(1 << exponent)
            .min(self.max_delay_ms);

        let millis = if self.jitter && window > 1 {
            let half = window / 2;
            half + rand::thread_rng().gen_range(0..=window - half)
        } else {
            window
        };
        Duration::from_millis(millis)
    }

    /// Delay before retrying `err`, or `None` if it should not be retried.
    ///
    /// A provider `Retry-After` hint takes precedence over backoff; a hint
    /// longer than `max_delay_ms` is not waited out.
    #[must_use]
    pub fn delay_for(&self, err: &Error, attempt: u32) -> Option<Duration> {
        if !err.is_retryable() || attempt >= self.max_attempts {
            return None;
        }
        match err.retry_after() {
            Some(hint) if hint > Duration::from_millis(self.max_delay_ms) => None,
            Some(hint) => Some(hint),
            None => Some(self.backoff(attempt)),
        }
    }
}

/// A point in time after which in-flight work is abandoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Expires `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Expires at `instant`.
    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Time left, or `None` when there is no deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Returns true once the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Runs `fut`, abandoning it with `Cancelled { stage }` when the deadline passes.
    pub async fn run<T, F>(&self, stage: Stage, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.0 {
            None => fut.await,
            Some(at) => tokio::time::timeout_at(at, fut)
                .await
                .map_err(|_| Error::Cancelled { stage })?,
        }
    }
}

/// Runs `op` under `deadline`, retrying transient failures per `policy`.
///
/// A retry whose delay would outlast the deadline is not attempted; the call
/// reports `Cancelled` instead.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    deadline: Deadline,
    stage: Stage,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match deadline.run(stage, op()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if err.is_cancelled() {
            return Err(err);
        }
        let Some(delay) = policy.delay_for(&err, attempt) else {
            return Err(err);
        };
        if deadline.remaining().is_some_and(|left| left <= delay) {
            return Err(Error::Cancelled { stage });
        }

        tracing::warn!(
            stage = %stage,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
