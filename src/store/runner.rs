use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use sqlx::{PgConnection, PgPool};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::Recorder;

const BEGIN_READ_COMMITTED: &str = "BEGIN ISOLATION LEVEL READ COMMITTED";

/// Bound and backoff for transient failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Sleep before the second attempt; doubled for each one after
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay after `failed` consecutive transient failures (1-based).
    fn backoff(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(16);
        self.base_backoff.saturating_mul(1u32 << exponent)
    }
}

/// Drive `attempt` until it succeeds, fails fast, or the policy is exhausted.
///
/// Fail-fast errors (see [`LedgerError::is_fail_fast`]) are returned as is.
/// Every other error counts against the bound; the last one is returned once
/// the bound is reached.
pub(crate) async fn retry_classified<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    recorder: &dyn Recorder,
    mut attempt: F,
) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let started = Instant::now();
    let max_attempts = policy.max_attempts.max(1);
    let mut failed = 0;

    let result = loop {
        match attempt().await {
            Ok(value) => break Ok(value),
            Err(err) if err.is_fail_fast() => {
                debug!(operation, error = %err, "operation rejected");
                return Err(err);
            }
            Err(err) => {
                failed += 1;
                recorder.record_error(operation);
                if failed >= max_attempts {
                    error!(operation, attempts = failed, error = %err, "retries exhausted");
                    break Err(err);
                }

                let delay = policy.backoff(failed);
                warn!(
                    operation,
                    attempt = failed,
                    max_attempts,
                    ?delay,
                    error = %err,
                    "transient failure, retrying"
                );
                recorder.record_retry(operation);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };

    recorder.observe_duration(operation, started.elapsed());
    result
}

/// Runs units of work in Read-Committed transactions with classified retries.
#[derive(Clone)]
pub struct TxRunner {
    pool: PgPool,
    policy: RetryPolicy,
    recorder: Arc<dyn Recorder>,
}

impl TxRunner {
    pub fn new(pool: PgPool, policy: RetryPolicy, recorder: Arc<dyn Recorder>) -> Self {
        Self {
            pool,
            policy,
            recorder,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Execute `work` in its own transaction, retrying the whole unit on
    /// transient failure. `work` is invoked once per attempt.
    pub async fn run<T, F>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        work: F,
    ) -> LedgerResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, LedgerResult<T>> + Send + Sync,
    {
        let work = &work;
        retry_classified(&self.policy, operation, self.recorder.as_ref(), move || {
            self.attempt(cancel, work)
        })
        .await
    }

    async fn attempt<T, F>(&self, cancel: &CancellationToken, work: &F) -> LedgerResult<T>
    where
        T: Send,
        F: for<'c> Fn(&'c mut PgConnection) -> BoxFuture<'c, LedgerResult<T>> + Send + Sync,
    {
        let mut tx = self.pool.begin_with(BEGIN_READ_COMMITTED).await?;

        let value = match work(&mut *tx).await {
            Ok(value) => value,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "rollback failed");
                }
                return Err(err);
            }
        };

        // Cancellation is honoured here and only here.
        if cancel.is_cancelled() {
            if let Err(rollback_err) = tx.rollback().await {
                debug!(error = %rollback_err, "rollback failed");
            }
            return Err(LedgerError::Cancelled);
        }

        tx.commit().await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingRecorder {
        errors: Mutex<HashMap<String, u32>>,
        retries: Mutex<HashMap<String, u32>>,
        durations: Mutex<Vec<String>>,
    }

    impl CountingRecorder {
        fn errors(&self, op: &str) -> u32 {
            self.errors.lock().unwrap().get(op).copied().unwrap_or(0)
        }

        fn retries(&self, op: &str) -> u32 {
            self.retries.lock().unwrap().get(op).copied().unwrap_or(0)
        }

        fn observed(&self) -> usize {
            self.durations.lock().unwrap().len()
        }
    }

    impl Recorder for CountingRecorder {
        fn record_error(&self, operation: &str) {
            *self.errors.lock().unwrap().entry(operation.into()).or_default() += 1;
        }

        fn record_retry(&self, operation: &str) {
            *self.retries.lock().unwrap().entry(operation.into()).or_default() += 1;
        }

        fn observe_duration(&self, operation: &str, _elapsed: Duration) {
            self.durations.lock().unwrap().push(operation.into());
        }
    }

    #[derive(Debug, Clone, Copy)]
    enum Outcome {
        Ok,
        Transient,
        Business,
    }

    fn no_backoff() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::ZERO,
        }
    }

    /// Replays `outcomes` one per attempt and returns (result, attempts made).
    fn drive(
        policy: RetryPolicy,
        outcomes: &[Outcome],
        recorder: &CountingRecorder,
    ) -> (LedgerResult<u32>, usize) {
        let script = Mutex::new(outcomes.iter().copied().collect::<VecDeque<_>>());
        let calls = Mutex::new(0usize);
        let result = futures::executor::block_on(retry_classified(
            &policy,
            "Op",
            recorder,
            || {
                *calls.lock().unwrap() += 1;
                let next = script.lock().unwrap().pop_front().unwrap_or(Outcome::Ok);
                async move {
                    match next {
                        Outcome::Ok => Ok(7),
                        Outcome::Transient => Err(LedgerError::Storage(sqlx::Error::PoolTimedOut)),
                        Outcome::Business => Err(LedgerError::InsufficientFunds),
                    }
                }
            },
        ));
        let attempts = *calls.lock().unwrap();
        (result, attempts)
    }

    #[test]
    fn succeeds_after_transient_failures() {
        let recorder = CountingRecorder::default();
        let (result, attempts) = drive(
            no_backoff(),
            &[Outcome::Transient, Outcome::Transient, Outcome::Ok],
            &recorder,
        );
        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts, 3);
        assert_eq!(recorder.errors("Op"), 2);
        assert_eq!(recorder.retries("Op"), 2);
        assert_eq!(recorder.observed(), 1);
    }

    #[test]
    fn returns_last_transient_error_when_exhausted() {
        let recorder = CountingRecorder::default();
        let (result, attempts) = drive(
            no_backoff(),
            &[Outcome::Transient; 5],
            &recorder,
        );
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(attempts, 3);
        assert_eq!(recorder.errors("Op"), 3);
        assert_eq!(recorder.retries("Op"), 2);
        assert_eq!(recorder.observed(), 1);
    }

    #[test]
    fn business_error_is_never_retried() {
        let recorder = CountingRecorder::default();
        let (result, attempts) = drive(
            no_backoff(),
            &[Outcome::Transient, Outcome::Business, Outcome::Ok],
            &recorder,
        );
        assert!(matches!(result, Err(LedgerError::InsufficientFunds)));
        assert_eq!(attempts, 2);
        assert_eq!(recorder.errors("Op"), 1);
    }

    #[test]
    fn zero_attempts_still_runs_once() {
        let recorder = CountingRecorder::default();
        let policy = RetryPolicy {
            max_attempts: 0,
            base_backoff: Duration::ZERO,
        };
        let (result, attempts) = drive(policy, &[Outcome::Transient], &recorder);
        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
    }

    #[tokio::test]
    async fn sleeps_between_attempts() {
        let recorder = CountingRecorder::default();
        let policy = RetryPolicy {
            max_attempts: 2,
            base_backoff: Duration::from_millis(20),
        };
        let mut first = true;
        let started = Instant::now();
        let result = retry_classified(&policy, "Op", &recorder, || {
            let fail = std::mem::replace(&mut first, false);
            async move {
                if fail {
                    Err(LedgerError::Storage(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    fn outcome() -> impl Strategy<Value = Outcome> {
        prop_oneof![
            Just(Outcome::Ok),
            Just(Outcome::Transient),
            Just(Outcome::Business),
        ]
    }

    proptest! {
        #[test]
        fn attempts_are_bounded_and_classified(
            outcomes in proptest::collection::vec(outcome(), 0..8),
            max_attempts in 1u32..5,
        ) {
            let recorder = CountingRecorder::default();
            let policy = RetryPolicy { max_attempts, base_backoff: Duration::ZERO };
            let (result, attempts) = drive(policy, &outcomes, &recorder);

            prop_assert!(attempts as u32 <= max_attempts);

            // The attempts made are a prefix of the script (missing entries succeed).
            let made: Vec<Outcome> = (0..attempts)
                .map(|i| outcomes.get(i).copied().unwrap_or(Outcome::Ok))
                .collect();
            let transient = made.iter().filter(|o| matches!(o, Outcome::Transient)).count() as u32;
            prop_assert_eq!(recorder.errors("Op"), transient);

            // Only the last attempt may be anything but transient.
            for o in &made[..made.len() - 1] {
                prop_assert!(matches!(o, Outcome::Transient));
            }

            match made.last().copied() {
                Some(Outcome::Ok) => prop_assert_eq!(result.unwrap(), 7),
                Some(Outcome::Business) => prop_assert!(matches!(result, Err(LedgerError::InsufficientFunds))),
                Some(Outcome::Transient) => {
                    prop_assert_eq!(attempts as u32, max_attempts);
                    prop_assert!(matches!(result, Err(LedgerError::Storage(_))));
                }
                None => prop_assert!(false, "no attempt made"),
            }
        }
    }
}
