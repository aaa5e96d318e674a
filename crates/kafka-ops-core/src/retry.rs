//! Bounded retry with exponential backoff.
//!
//! Metadata reads and offset commits carry separate budgets: reads get one
//! immediate retry, commits back off between attempts. Only errors that
//! report themselves as transient are retried.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Retry budget for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds; doubles per retry
    #[serde(default)]
    pub base_delay_ms: u64,

    /// Upper bound for a single backoff delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::commits()
    }
}

impl RetryPolicy {
    /// One immediate retry.
    pub fn metadata_reads() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn commits() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: 100,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }

    /// Backoff before retry number `retry` (1-based), with up to 10% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        if self.base_delay_ms == 0 || retry == 0 {
            return Duration::ZERO;
        }
        let exp = retry.saturating_sub(1).min(16);
        let backoff_ms = self
            .base_delay_ms
            .saturating_mul(2u64.saturating_pow(exp))
            .min(self.max_delay_ms.max(self.base_delay_ms));
        let jitter_ms = (backoff_ms as f64 * 0.1 * jitter_fraction()) as u64;
        Duration::from_millis(backoff_ms + jitter_ms)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && self.allows_retry(attempt) => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.max_attempts, delay, e
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Retry budgets per operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "RetryPolicy::metadata_reads")]
    pub reads: RetryPolicy,

    #[serde(default = "RetryPolicy::commits")]
    pub commits: RetryPolicy,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            reads: RetryPolicy::metadata_reads(),
            commits: RetryPolicy::commits(),
        }
    }
}

fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        let d1 = policy.delay_for(1).as_millis();
        let d2 = policy.delay_for(2).as_millis();
        let d8 = policy.delay_for(8).as_millis();
        assert!((100..=110).contains(&d1), "{}", d1);
        assert!((200..=220).contains(&d2), "{}", d2);
        assert!((1_000..=1_100).contains(&d8), "{}", d8);
    }

    #[test]
    fn test_metadata_reads_retry_once_immediately() {
        let policy = RetryPolicy::metadata_reads();
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_run_retries_transient_only() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = RetryPolicy::metadata_reads()
            .run("watermarks", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Err(Error::BrokerUnavailable("blip".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::commits()
            .run("watermarks", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::UnknownGroup { group: "g".into() })
            })
            .await;
        assert!(matches!(result, Err(Error::UnknownGroup { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = RetryPolicy::metadata_reads()
            .run("watermarks", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::BrokerUnavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(Error::BrokerUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
