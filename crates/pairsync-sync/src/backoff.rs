//! Retry delays
//!
//! Network calls made inside a processor are retried in place a few times
//! with an exponential, jittered delay before the failure is recorded on
//! the pair. Locked local files use a separate, deterministic schedule.

use std::future::Future;
use std::time::Duration;

use pairsync_core::ports::RemoteError;
use rand::Rng;
use tracing::{info, warn};

/// In-place retries before the error reaches the processor
pub const MAX_RETRIES: u32 = 3;

/// Upper bound of the locked-file delay, in seconds
pub const LOCKED_DELAY_CAP: u64 = 64;

/// Exponential backoff; with jitter the delay is drawn from the upper half
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let exp = base_ms.saturating_mul(1u64 << attempt.min(16)).min(max_ms);
        let delay_ms = if self.jitter { rng.gen_range(exp / 2..=exp) } else { exp };
        Duration::from_millis(delay_ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(16), true)
    }
}

/// Runs a remote call, retrying transient failures in place
///
/// `429` answers wait for the announced `Retry-After` when there is one.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    backoff: Backoff,
    f: F,
) -> Result<T, RemoteError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if attempt < MAX_RETRIES && err.is_transient() => {
                let delay = match &err {
                    RemoteError::TooManyRequests {
                        retry_after: Some(secs),
                    } => Duration::from_secs(*secs),
                    _ => backoff.delay(attempt),
                };
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Delay before retrying a file locked by another process
pub fn locked_delay(attempts: u32) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempts).min(LOCKED_DELAY_CAP))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_backoff_without_jitter_is_exponential() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u64> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800]);
    }

    #[test]
    fn test_backoff_with_jitter_is_bounded() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!(delay >= Duration::from_millis(400));
            assert!(delay <= Duration::from_millis(800));
        }
    }

    #[test]
    fn test_locked_delay_is_capped() {
        assert_eq!(locked_delay(0), Duration::from_secs(1));
        assert_eq!(locked_delay(3), Duration::from_secs(8));
        assert_eq!(locked_delay(6), Duration::from_secs(64));
        assert_eq!(locked_delay(40), Duration::from_secs(64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_recovers_from_transient_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = with_retry("get_info", Backoff::default(), move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(RemoteError::Network("connection reset".into()))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry("delete", Backoff::default(), move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(RemoteError::Forbidden("doc-1".into()))
        })
        .await;
        assert_eq!(result, Err(RemoteError::Forbidden("doc-1".into())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
