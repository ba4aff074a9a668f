//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Calculate exponential backoff delay with jitter.
///
/// Attempt 1 waits `base`, each later attempt doubles, capped at `max`.
/// Up to 10% jitter is added on top so retries from many jobs spread out.
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let base_ms = base.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let capped_delay = base_ms.saturating_mul(exponential_base).min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Delay before re-running a job whose `attempt`-th try just failed.
pub fn retry_delay(config: &RetryConfig, attempt: u32) -> Duration {
    calculate_backoff(attempt, config.base_delay, config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(2000);

        assert_eq!(calculate_backoff(0, base, max), Duration::ZERO);

        let b1 = calculate_backoff(1, base, max);
        assert!(b1 >= Duration::from_millis(100) && b1 < Duration::from_millis(110));

        let b2 = calculate_backoff(2, base, max);
        assert!(b2 >= Duration::from_millis(200) && b2 < Duration::from_millis(220));
    }

    #[test]
    fn test_backoff_is_capped() {
        let max = Duration::from_millis(1000);
        let capped = calculate_backoff(10, Duration::from_millis(100), max);
        assert!(capped >= max && capped < Duration::from_millis(1100));

        // Large attempt numbers must not overflow.
        let huge = calculate_backoff(200, Duration::from_secs(1), Duration::from_secs(300));
        assert!(huge >= Duration::from_secs(300));
    }

    #[test]
    fn test_retry_delay_uses_config() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(15),
        };
        let d = retry_delay(&config, 3);
        assert!(d >= Duration::from_millis(15) && d <= Duration::from_millis(16));
    }
}
