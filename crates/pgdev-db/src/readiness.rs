//! Bounded readiness polling.
//!
//! A freshly started database container takes a variable amount of time to
//! accept connections. Readiness is checked on a fixed interval for a fixed
//! number of attempts; exhausting the budget is fatal.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tracing::{debug, info};

use crate::error::DbError;
use crate::postgres::{PostgresConfig, PostgresPool};

/// Default number of readiness attempts.
const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Default delay between attempts in seconds.
const DEFAULT_INTERVAL_SECS: u64 = 3;

/// Default timeout of a single attempt in seconds.
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 5;

/// Retry budget for readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between two attempts.
    pub interval: Duration,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl ReadinessPolicy {
    /// Number of retries after the first attempt.
    fn retries(&self) -> usize {
        usize::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX)
    }
}

/// Run `check` until it succeeds or the policy is exhausted.
///
/// Returns the number of attempts made on success.
///
/// # Errors
///
/// Returns [`DbError::NotReady`] carrying the final attempt error once every
/// attempt has failed. The error is never returned earlier.
pub async fn poll_until_ready<P, Fut>(policy: &ReadinessPolicy, check: P) -> Result<u32, DbError>
where
    P: Fn() -> Fut,
    Fut: Future<Output = Result<(), DbError>>,
{
    let attempts = AtomicU32::new(0);
    let backoff = ConstantBuilder::default()
        .with_delay(policy.interval)
        .with_max_times(policy.retries());

    let counter = &attempts;
    let check = &check;
    let result = (move || async move {
        counter.fetch_add(1, Ordering::Relaxed);
        check().await
    })
    .retry(backoff)
    .sleep(tokio::time::sleep)
    .notify(|err: &DbError, delay: Duration| {
        debug!(
            error = %err,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "waiting for database"
        );
    })
    .await;

    let made = attempts.load(Ordering::Relaxed);
    match result {
        Ok(()) => Ok(made),
        Err(e) => Err(DbError::NotReady {
            attempts: made,
            last_error: e.to_string(),
        }),
    }
}

/// Wait until the database at `url` answers `SELECT 1`.
///
/// # Errors
///
/// Returns [`DbError::NotReady`] if the database never answers within the
/// policy, or [`DbError::Config`] immediately if the URL is malformed.
pub async fn wait_for_ready(url: &str, policy: &ReadinessPolicy) -> Result<u32, DbError> {
    // A malformed URL will never become ready; fail before burning the budget.
    let config = PostgresConfig::parse(url)?.with_connect_timeout(policy.attempt_timeout);
    let timeout = policy.attempt_timeout;

    let attempts = poll_until_ready(policy, || {
        let config = config.clone();
        async move {
            match tokio::time::timeout(timeout, check_once(&config)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DbError::AttemptTimeout),
            }
        }
    })
    .await?;

    info!(attempts, "database ready");
    Ok(attempts)
}

/// Open a single-connection pool, run `SELECT 1`, close it.
async fn check_once(config: &PostgresConfig) -> Result<(), DbError> {
    let pool = PostgresPool::connect(config).await?;
    let result = pool.ping().await;
    pool.close().await;
    result
}
