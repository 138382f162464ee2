//! Readiness polling with linear backoff.
//!
//! Used wherever the bridger waits on something another process owns: the
//! desktop container reaching the running state, or a freshly spawned
//! isolated daemon answering on its socket. With linear backoff attempt `n`
//! (1-based) is followed by a delay of `n * base_delay`, so 10 attempts at
//! 500ms wait at most 22.5s.
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Linear,
    Constant,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
    /// Hard bound on the whole wait, checked before each sleep
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            backoff: Backoff::Linear,
            deadline: None,
        }
    }

    /// Poll every `interval` until `deadline` has passed
    pub fn constant(interval: Duration, deadline: Duration) -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: interval,
            backoff: Backoff::Constant,
            deadline: Some(deadline),
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Linear => self.base_delay * attempt,
            Backoff::Constant => self.base_delay,
        }
    }
}

/// Outcome of one readiness check
pub enum Readiness<T, E> {
    Ready(T),
    /// Not ready yet; the reason is kept for the final error
    NotYet(String),
    /// Permanent failure, stop retrying
    Fatal(E),
}

/// Why `retry_until_ready` gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    Exhausted { attempts: u32, last_reason: String, waited: Duration },
    Fatal(E),
}

/// Poll `check` until it reports ready, fails fatally, or the policy runs out.
///
/// Cancellation is the caller's: dropping the returned future stops the loop
/// at its next await point.
pub async fn retry_until_ready<T, E, F, Fut>(
    policy: RetryPolicy,
    description: &str,
    mut check: F,
) -> Result<T, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness<T, E>>,
{
    let started = Instant::now();
    let mut last_reason = String::from("not attempted");
    let mut attempted = 0;

    for attempt in 1..=policy.max_attempts {
        attempted = attempt;
        match check().await {
            Readiness::Ready(value) => {
                if attempt > 1 {
                    tracing::debug!("{} ready after {} attempts", description, attempt);
                }
                return Ok(value);
            }
            Readiness::Fatal(e) => return Err(RetryFailure::Fatal(e)),
            Readiness::NotYet(reason) => last_reason = reason,
        }

        if attempt == policy.max_attempts {
            break;
        }

        let delay = policy.delay_after(attempt);
        if let Some(deadline) = policy.deadline {
            if started.elapsed() + delay > deadline {
                break;
            }
        }

        tracing::debug!(
            "{} not ready (attempt {}): {}. Retrying in {:?}",
            description,
            attempt,
            last_reason,
            delay
        );
        sleep(delay).await;
    }

    Err(RetryFailure::Exhausted {
        attempts: attempted,
        last_reason,
        waited: started.elapsed(),
    })
}
