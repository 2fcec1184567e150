use crate::BackendError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff state. Not shareable between tasks; each retry loop
/// owns its instance, and the state is reset whenever a loop finishes.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    multiplier: u32,
    max_interval: Duration,
    next: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(initial: Duration, multiplier: u32, max_interval: Duration) -> Self {
        Self {
            initial,
            multiplier,
            max_interval,
            next: initial,
        }
    }

    /// Backoff used around API calls: 1 s, doubling, capped at 5 min,
    /// retrying forever.
    #[must_use]
    pub fn eternal() -> Self {
        Self::new(Duration::from_secs(1), 2, Duration::from_secs(5 * 60))
    }

    /// Backoff used around watcher restarts: 5 s, doubling, capped at
    /// 5 min, retrying forever.
    #[must_use]
    pub fn slow_eternal() -> Self {
        Self::new(Duration::from_secs(5), 2, Duration::from_secs(5 * 60))
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }

    /// Returns the delay to sleep before the next attempt and advances the
    /// internal state.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * self.multiplier).min(self.max_interval);
        delay
    }
}

/// Outcome classification for a single retryable attempt.
#[derive(Debug)]
pub enum RetryError {
    /// Worth retrying after a backoff sleep.
    Transient(BackendError),
    /// Retrying cannot help; surface immediately.
    Permanent(BackendError),
}

impl RetryError {
    #[must_use]
    pub fn into_inner(self) -> BackendError {
        match self {
            Self::Transient(err) | Self::Permanent(err) => err,
        }
    }
}

/// Marks a transient error permanent once the token has been cancelled, so
/// shutdown never wastes a backoff sleep.
#[must_use]
pub fn permanent_if_cancelled(cancel: &CancellationToken, err: RetryError) -> RetryError {
    match err {
        RetryError::Transient(inner) if cancel.is_cancelled() => RetryError::Permanent(inner),
        other => other,
    }
}

/// Drives `op` until it succeeds, fails permanently, exhausts `max_retries`,
/// or the token is cancelled. Cancellation aborts the in-flight attempt and
/// is returned as [`BackendError::Cancelled`]. The backoff state is reset on
/// every exit so a later loop reusing it starts from the initial interval.
pub async fn retry<T, F, Fut>(
    cancel: &CancellationToken,
    backoff: &mut ExponentialBackoff,
    max_retries: Option<u32>,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let mut retries = 0u32;
    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(RetryError::Permanent(BackendError::Cancelled)),
            attempt = op() => attempt.map_err(|err| permanent_if_cancelled(cancel, err)),
        };
        match attempt {
            Ok(value) => {
                backoff.reset();
                return Ok(value);
            }
            Err(RetryError::Permanent(err)) => {
                backoff.reset();
                return Err(err);
            }
            Err(RetryError::Transient(err)) => {
                if let Some(max) = max_retries {
                    if retries >= max {
                        backoff.reset();
                        return Err(err);
                    }
                }
                retries += 1;
                let delay = backoff.next_delay();
                tokio::select! {
                    () = cancel.cancelled() => {
                        backoff.reset();
                        return Err(err);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
