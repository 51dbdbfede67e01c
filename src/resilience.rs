//! Bounded retry with explicit per-attempt timeouts.
//!
//! Every network call the relay makes (authority, cache, ledger) goes
//! through [`call`].  An attempt that exceeds its timeout is treated exactly
//! like a connection failure.  There is no unbounded retry: at most
//! `attempts` tries, separated by a fixed backoff.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub backoff: Duration,
    /// Total attempts, including the first.  Always at least one.
    pub attempts: u32,
}

impl RetryPolicy {
    /// One attempt plus a single retry.
    pub fn retry_once(timeout: Duration, backoff: Duration) -> Self {
        Self {
            timeout,
            backoff,
            attempts: 2,
        }
    }

    /// Same timeout, no retry.
    pub fn single(self) -> Self {
        Self {
            attempts: 1,
            ..self
        }
    }
}

#[derive(Debug)]
pub enum CallError<E> {
    Timeout(Duration),
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for CallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallError::Timeout(d) => write!(f, "timed out after {}ms", d.as_millis()),
            CallError::Failed(e) => write!(f, "{e}"),
        }
    }
}

/// Run `op` under `policy`, returning the first success or the last error.
pub async fn call<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        let err = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => CallError::Failed(e),
            Err(_) => CallError::Timeout(policy.timeout),
        };
        if attempt >= attempts {
            return Err(err);
        }
        debug!(%what, attempt, error = %err, "call failed, retrying");
        tokio::time::sleep(policy.backoff).await;
        attempt += 1;
    }
}
