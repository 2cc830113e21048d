//! Bounded exponential backoff
//!
//! One combinator for every "try again later" loop in the control plane:
//! retrying transient provider/SSH failures and polling an external system
//! until it reports readiness. Both are bounded by an attempt count and/or an
//! overall deadline; nothing here waits forever.

use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Backoff parameters
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Upper bound on attempts (including the first)
    pub max_attempts: Option<u32>,
    /// Upper bound on total elapsed time
    pub deadline: Option<Duration>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(5),
            deadline: None,
        }
    }
}

impl Backoff {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Default::default()
        }
    }

    pub fn with_initial(mut self, initial: Duration) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn unbounded_attempts(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Delay before attempt `n + 1`, given that `n` attempts have failed.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = self.multiplier.powi(failures.saturating_sub(1) as i32);
        let delay = self.initial.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max.as_secs_f64()))
    }
}

/// Outcome of one readiness probe
#[derive(Debug)]
pub enum Poll<T> {
    Ready(T),
    Pending,
}

/// Retry `op` while it fails with a retryable error.
///
/// Non-retryable errors are returned immediately. When the attempt budget or
/// deadline runs out, the last error is returned.
pub async fn retry<T, F, Fut>(policy: &Backoff, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut failures = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                failures += 1;
                if policy.max_attempts.map_or(false, |max| failures >= max) {
                    debug!("{}: giving up after {} attempts: {}", operation, failures, e);
                    return Err(e);
                }
                let delay = policy.delay_for(failures);
                if let Some(deadline) = policy.deadline {
                    if started.elapsed() + delay > deadline {
                        debug!("{}: deadline reached: {}", operation, e);
                        return Err(e);
                    }
                }
                debug!(
                    "{}: attempt {} failed ({}), retrying in {:?}",
                    operation, failures, e, delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Poll `probe` until it reports ready.
///
/// Retryable probe errors count as "not ready yet"; other errors abort.
/// Exhausting the budget yields [`Error::Timeout`]. A probe still running
/// when the deadline passes is cancelled.
pub async fn poll_until<T, F, Fut>(policy: &Backoff, operation: &str, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Poll<T>>>,
{
    let started = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let outcome = match policy.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_sub(started.elapsed());
                match tokio::time::timeout(remaining, probe()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!("{}: probe outlived the deadline", operation);
                        return Err(Error::timeout(operation, started.elapsed()));
                    }
                }
            }
            None => probe().await,
        };
        match outcome {
            Ok(Poll::Ready(value)) => return Ok(value),
            Ok(Poll::Pending) => {}
            Err(e) if e.is_retryable() => {
                debug!("{}: probe failed transiently: {}", operation, e);
            }
            Err(e) => return Err(e),
        }

        if policy.max_attempts.map_or(false, |max| attempts >= max) {
            return Err(Error::timeout(operation, started.elapsed()));
        }

        let mut delay = policy.delay_for(attempts);
        if let Some(deadline) = policy.deadline {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(Error::timeout(operation, elapsed));
            }
            delay = delay.min(deadline - elapsed);
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_growth_is_capped() {
        let policy = Backoff::default()
            .with_initial(Duration::from_secs(1))
            .with_max(Duration::from_secs(5));
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(30), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry(&Backoff::attempts(5), "flaky", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_on_permanent() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry(&Backoff::attempts(5), "auth", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Authentication {
                    message: "denied".into(),
                    detail: None,
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Authentication { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = retry(&Backoff::attempts(3), "down", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transient("503"))
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let policy = Backoff::default()
            .unbounded_attempts()
            .with_deadline(Duration::from_secs(300));
        let value = poll_until(&policy, "boot", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 4 {
                    Ok(Poll::Pending)
                } else {
                    Ok(Poll::Ready("203.0.113.7"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, "203.0.113.7");
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_times_out() {
        let policy = Backoff::default()
            .with_initial(Duration::from_secs(2))
            .unbounded_attempts()
            .with_deadline(Duration::from_secs(300));
        let started = Instant::now();
        let err = poll_until(&policy, "instance readiness", || async {
            Ok::<Poll<()>, Error>(Poll::Pending)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(300));
        assert!(elapsed < Duration::from_secs(331));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_until_cancels_a_hung_check() {
        let policy = Backoff::default()
            .with_initial(Duration::from_secs(10))
            .with_max(Duration::from_secs(10))
            .unbounded_attempts()
            .with_deadline(Duration::from_secs(300));
        let started = Instant::now();
        let err = poll_until(&policy, "ssh reachability", || async move {
            if started.elapsed() >= Duration::from_secs(290) {
                tokio::time::sleep(Duration::from_secs(600)).await;
            }
            Ok::<Poll<()>, Error>(Poll::Pending)
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(300));
    }
}
