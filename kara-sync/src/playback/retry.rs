//! Bounded retry policy shared by the follower start sequences

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Maximum attempts plus the delay schedule between them
///
/// `delays_ms[i]` is the pause before attempt `i + 2`. When the schedule is
/// shorter than the attempt count its last entry is reused.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub delays_ms: Vec<u64>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delays_ms: Vec<u64>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays_ms,
        }
    }

    /// Three attempts with increasing backoff
    pub fn follower_start() -> Self {
        Self::new(3, vec![50, 150, 300])
    }

    /// One attempt, no waiting
    pub fn single() -> Self {
        Self::new(1, Vec::new())
    }

    /// Delay to wait after `failed_attempt` (1-based) before trying again
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        let index = failed_attempt.saturating_sub(1) as usize;
        let ms = self
            .delays_ms
            .get(index)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Run `op` until it succeeds or attempts run out
    ///
    /// On exhaustion returns the attempt count and the last error.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, (u32, E)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_attempts => return Err((attempt, e)),
                Err(e) => {
                    let delay = self.delay_after(attempt);
                    debug!("Attempt {}/{} failed ({}), retrying in {:?}", attempt, self.max_attempts, e, delay);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::follower_start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_schedule_reuses_last_entry() {
        let policy = RetryPolicy::new(5, vec![50, 150]);
        assert_eq!(policy.delay_after(1), Duration::from_millis(50));
        assert_eq!(policy.delay_after(2), Duration::from_millis(150));
        assert_eq!(policy.delay_after(4), Duration::from_millis(150));

        assert_eq!(RetryPolicy::single().delay_after(1), Duration::ZERO);
    }

    #[test]
    fn test_zero_attempts_normalized() {
        assert_eq!(RetryPolicy::new(0, vec![]).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let started = tokio::time::Instant::now();

        let result: Result<u32, (u32, String)> = RetryPolicy::follower_start()
            .run(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("not yet".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 50ms + 150ms of backoff
        assert_eq!(started.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let result: Result<(), (u32, String)> = RetryPolicy::follower_start()
            .run(|attempt| async move { Err(format!("fail {}", attempt)) })
            .await;

        assert_eq!(result, Err((3, "fail 3".to_string())));
    }
}
