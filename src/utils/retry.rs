//! Retry utilities: backoff builders.
//!
//! Uses `backon`. Connection attempts at startup back off exponentially with
//! jitter; fallback publishes retry at a fixed pace.

use std::time::Duration;

use backon::{ConstantBuilder, ExponentialBuilder};

/// Backoff for broker and database connection retries at startup.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 30
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Fixed-delay backoff allowing `attempts` tries in total.
///
/// Zero attempts is treated as one.
pub fn fixed_backoff(attempts: usize, delay: Duration) -> ConstantBuilder {
    ConstantBuilder::default()
        .with_delay(delay)
        .with_max_times(attempts.saturating_sub(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::{BackoffBuilder, Retryable};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_fixed_backoff_yields_attempts_minus_one_delays() {
        let delays: Vec<Duration> = fixed_backoff(3, Duration::from_millis(7)).build().collect();
        assert_eq!(delays, vec![Duration::from_millis(7); 2]);
    }

    #[test]
    fn test_fixed_backoff_single_attempt() {
        assert_eq!(fixed_backoff(1, Duration::from_secs(1)).build().count(), 0);
        assert_eq!(fixed_backoff(0, Duration::from_secs(1)).build().count(), 0);
    }

    #[tokio::test]
    async fn test_retry_stops_at_first_success() {
        let calls = AtomicUsize::new(0);
        let calls_ref = &calls;

        let result: Result<usize, &str> = (|| async move {
            let n = calls_ref.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 2 {
                Err("not yet")
            } else {
                Ok(n)
            }
        })
        .retry(fixed_backoff(5, Duration::from_millis(1)))
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
