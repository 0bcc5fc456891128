//! Retry-on-busy for the embedded catalog store.
//!
//! Several workers share the same catalog files, and SQLite answers lock contention with
//! `SQLITE_BUSY` / `SQLITE_LOCKED` instead of waiting. Every contending operation goes through
//! [`retry_on_busy`], which sleeps with decorrelated jitter between attempts until the time
//! budget is spent.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Primary result code of `SQLITE_BUSY`.
const SQLITE_BUSY: i32 = 5;
/// Primary result code of `SQLITE_LOCKED`.
const SQLITE_LOCKED: i32 = 6;

/// Backoff policy applied to busy/locked conditions.
#[derive(Debug, Clone, Copy)]
pub struct BusyRetryPolicy {
    /// Smallest sleep between two attempts.
    pub base: Duration,
    /// Largest sleep between two attempts.
    pub cap: Duration,
    /// Total time after which contention becomes an error.
    pub budget: Duration,
}

impl BusyRetryPolicy {
    pub const fn new(base: Duration, cap: Duration, budget: Duration) -> Self {
        Self { base, cap, budget }
    }

    /// Computes the next sleep from the previous one.
    ///
    /// The sleep is drawn uniformly between `base` and three times the previous sleep, then
    /// capped, which spreads concurrent retries apart without growing unbounded.
    pub fn next_sleep(&self, previous: Duration) -> Duration {
        let low = self.base.as_millis() as u64;
        let high = (previous.as_millis() as u64).saturating_mul(3).max(low + 1);
        let sleep = rand::thread_rng().gen_range(low..=high);

        Duration::from_millis(sleep).min(self.cap)
    }
}

impl Default for BusyRetryPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(10),
            Duration::from_millis(350),
            Duration::from_secs(5),
        )
    }
}

/// Returns whether `err` is a busy or locked condition of the store.
pub fn is_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_error) = err else {
        return false;
    };

    db_error
        .code()
        .and_then(|code| code.parse::<i32>().ok())
        .is_some_and(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
}

/// Tracks the sleeps and the time budget of one contended operation.
///
/// Used directly where the operation borrows a connection mutably and cannot be expressed as a
/// re-callable closure, such as `BEGIN IMMEDIATE` on an acquired connection.
#[derive(Debug)]
pub struct BusyBackoff {
    policy: BusyRetryPolicy,
    started: Instant,
    sleep: Duration,
    attempts: u32,
}

impl BusyBackoff {
    pub fn new(policy: BusyRetryPolicy) -> Self {
        Self {
            policy,
            started: Instant::now(),
            sleep: policy.base,
            attempts: 0,
        }
    }

    /// Records a busy attempt and sleeps before the next one.
    ///
    /// Returns `false` without sleeping once the budget is spent.
    pub async fn wait(&mut self) -> bool {
        self.attempts += 1;

        if self.started.elapsed() >= self.policy.budget {
            warn!(
                attempts = self.attempts,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "catalog still busy after retry budget"
            );
            return false;
        }

        self.sleep = self.policy.next_sleep(self.sleep);
        tokio::time::sleep(self.sleep).await;

        true
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Runs `op` until it succeeds, fails with a non-busy error, or the budget is exhausted.
///
/// The number of attempts is not bounded; only elapsed time is. The last busy error is
/// returned on exhaustion.
pub async fn retry_on_busy<T, F, Fut>(policy: &BusyRetryPolicy, mut op: F) -> Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = BusyBackoff::new(*policy);

    loop {
        match op().await {
            Ok(value) => {
                if backoff.attempts() > 0 {
                    debug!(
                        retries = backoff.attempts(),
                        "catalog operation succeeded after contention"
                    );
                }
                return Ok(value);
            }
            Err(err) if is_busy(&err) => {
                if !backoff.wait().await {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleeps_stay_within_bounds() {
        let policy = BusyRetryPolicy::default();
        let mut sleep = policy.base;

        for _ in 0..200 {
            sleep = policy.next_sleep(sleep);
            assert!(sleep >= policy.base);
            assert!(sleep <= policy.cap);
        }
    }

    #[test]
    fn non_database_errors_are_not_busy() {
        assert!(!is_busy(&sqlx::Error::RowNotFound));
        assert!(!is_busy(&sqlx::Error::PoolTimedOut));
    }

    #[tokio::test]
    async fn backoff_gives_up_after_the_budget() {
        let policy = BusyRetryPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            Duration::from_millis(10),
        );
        let mut backoff = BusyBackoff::new(policy);

        let mut waits = 0;
        while backoff.wait().await {
            waits += 1;
            assert!(waits < 1_000);
        }

        assert!(waits > 0);
        assert_eq!(backoff.attempts(), waits + 1);
    }

    #[tokio::test]
    async fn non_busy_errors_are_returned_immediately() {
        let policy = BusyRetryPolicy::default();
        let mut calls = 0;

        let result: Result<(), _> = retry_on_busy(&policy, || {
            calls += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(matches!(result, Err(sqlx::Error::RowNotFound)));
        assert_eq!(calls, 1);
    }
}
