use std::future::Future;

use tokio::time::{Duration, Instant, sleep};
use tracing::*;

use crate::{Error, Result};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

/// Local, bounded retry for writes that may hit conflicts or a busy API server.
/// The first attempt runs immediately.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RETRY_INTERVAL,
            timeout: DEFAULT_RETRY_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    pub fn start(&self) -> Retrier {
        Retrier {
            policy: *self,
            deadline: Instant::now() + self.timeout,
            attempts: 0,
        }
    }
}

/// One running retry budget
#[derive(Debug)]
pub struct Retrier {
    policy: RetryPolicy,
    deadline: Instant,
    attempts: u32,
}

impl Retrier {
    /// Sleep and return true if `err` is worth another attempt within the budget
    pub async fn wait(&mut self, err: &Error) -> bool {
        if !err.is_retryable() || Instant::now() + self.policy.interval > self.deadline {
            return false;
        }
        self.attempts += 1;
        debug!(attempt = self.attempts, "retrying after transient error: {err}");
        sleep(self.policy.interval).await;
        true
    }

    /// Map the final error, turning an exhausted budget into a timeout
    pub fn give_up(&self, err: Error, what: &str) -> Error {
        if err.is_retryable() {
            Error::Timeout(self.policy.timeout, format!("{what}: {err}"))
        } else {
            err
        }
    }
}

pub async fn retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retrier = policy.start();
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if retrier.wait(&e).await => continue,
            Err(e) => return Err(retrier.give_up(e, what)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn api_error(code: u16, reason: &str) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_absorbed() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy::default();
        let out = retry(&policy, "write", move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(api_error(409, "Conflict"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let res: Result<()> = retry(&RetryPolicy::default(), "write", move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(api_error(403, "Forbidden"))
        })
        .await;
        assert!(matches!(res, Err(Error::KubeError(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_runs_out() {
        let policy = RetryPolicy {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
        };
        let res: Result<()> = retry(&policy, "write", || async { Err(api_error(500, "InternalError")) }).await;
        assert!(matches!(res, Err(Error::Timeout(_, _))));
    }
}
