//! Bounded polling for conditions that are fulfilled by external controllers.
//!
//! A wait in this crate is always "call a status check on a fixed interval
//! until it reports success, or give up once the timeout has elapsed". The
//! check decides whether a failure is worth retrying ([`Outcome::Retry`]) or
//! has to be surfaced immediately ([`Outcome::Abort`]).

use std::{future::Future, time::Duration};

use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Result of a single polling attempt.
#[derive(Debug)]
pub enum Outcome {
    /// The awaited condition holds.
    Done,

    /// The condition does not hold yet; the error is kept as the last observed problem.
    Retry(Error),

    /// The condition can never be met; stop polling.
    Abort(Error),
}

impl Outcome {
    /// Map a status check into an outcome, retrying on every error.
    pub fn retry_on_error(result: Result<()>) -> Self {
        match result {
            Ok(()) => Outcome::Done,
            Err(e) => Outcome::Retry(e),
        }
    }
}

/// Call `check` every `interval` until it reports [`Outcome::Done`] or `timeout` has elapsed.
///
/// The first attempt happens immediately. `what` names the awaited object in logs and errors.
pub async fn until_timeout<F, Fut>(
    interval: Duration,
    timeout: Duration,
    what: impl Into<String>,
    mut check: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome>,
{
    let what = what.into();
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let last_error = match check().await {
            Outcome::Done => {
                debug!(what = %what, attempt, "Condition met");
                return Ok(());
            }
            Outcome::Abort(e) => return Err(e),
            Outcome::Retry(e) => e,
        };

        let now = Instant::now();
        if now + interval > deadline {
            return Err(Error::Timeout {
                what,
                timeout,
                last_error: Some(Box::new(last_error)),
            });
        }

        warn!(
            what = %what,
            attempt,
            error = %last_error,
            retry_in_ms = interval.as_millis() as u64,
            "Condition not met yet, retrying"
        );
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn not_ready() -> Error {
        Error::Unhealthy("thing".into(), "not ready".into())
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_the_check_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = until_timeout(Duration::from_secs(2), Duration::from_secs(60), "thing", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Outcome::Retry(not_ready())
                } else {
                    Outcome::Done
                }
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_on_severe_errors() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = until_timeout(Duration::from_secs(2), Duration::from_secs(60), "thing", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Outcome::Abort(Error::IllegalConfig("broken".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::IllegalConfig(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_with_the_last_error() {
        let start = Instant::now();

        let result = until_timeout(Duration::from_secs(2), Duration::from_secs(10), "thing", || async {
            Outcome::Retry(not_ready())
        })
        .await;

        match result {
            Err(Error::Timeout { what, last_error, .. }) => {
                assert_eq!(what, "thing");
                assert!(matches!(last_error.as_deref(), Some(Error::Unhealthy(_, _))));
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert!(start.elapsed() <= Duration::from_secs(10));
    }
}
