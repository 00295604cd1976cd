//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! Drives retry of outbound participant calls, health probes, and broker
//! reconnects. Retriability is an HTTP-status judgment here rather than a
//! gRPC one: 4xx is a business rejection (never retried by this layer —
//! it routes straight to a business failure / compensation), 5xx and
//! transport-level timeouts are retriable.

use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retry attempts (0 = no retries, just initial attempt).
    pub max_retries: u32,
    /// Jitter factor: delay is multiplied by random value in [1-jitter, 1+jitter].
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            max_retries: 10,
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    /// Retry config for the outbox drainer's publish attempts: more patient
    /// than the default, since a publish failure leaves the row untouched
    /// for the next poll tick anyway.
    pub fn for_outbox_drain() -> Self {
        Self {
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            max_retries: 3,
            jitter: 0.25,
        }
    }

    /// Retry config for broker reconnect loops.
    pub fn for_broker_reconnect() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 0, // caller loops indefinitely, backoff only
            jitter: 0.1,
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Exponential backoff: delay = base * 2^attempt, capped at max_delay,
    /// with deterministic hash-based jitter (no `rand` dependency for
    /// something this small).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);

        let jittered_ms = if self.jitter > 0.0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
            let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
            let jitter_factor = 1.0 + (jitter_pct * self.jitter);
            (capped_ms as f64 * jitter_factor) as u64
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }

    /// Check if another retry attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Classifies an HTTP status code for participant-adapter retry purposes.
///
/// - 2xx: not an error.
/// - 4xx: business rejection, never retriable.
/// - 5xx and anything else: retriable.
pub fn is_retryable_status(status: u16) -> bool {
    !(200..300).contains(&status) && !(400..500).contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = RetryConfig::default();
        assert_eq!(config.base_delay, Duration::from_millis(10));
        assert_eq!(config.max_retries, 10);
    }

    #[test]
    fn exponential_backoff() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            jitter: 0.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
    }

    #[test]
    fn delay_capped_at_max() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            max_retries: 10,
            jitter: 0.0,
        };

        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(500));
    }

    #[test]
    fn jitter_applies_within_bounds() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            max_retries: 5,
            jitter: 0.25,
        };

        let ms = config.delay_for_attempt(0).as_millis() as f64;
        assert!((750.0..=1250.0).contains(&ms), "delay {ms} out of bounds");
    }

    #[test]
    fn should_retry_respects_max() {
        let config = RetryConfig {
            max_retries: 3,
            ..Default::default()
        };

        assert!(config.should_retry(2));
        assert!(!config.should_retry(3));
    }

    #[test]
    fn status_retriability() {
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(201));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
        assert!(!is_retryable_status(409));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
    }

    #[test]
    fn no_overflow_on_large_attempt() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
            max_retries: 100,
            jitter: 0.0,
        };

        let delay = config.delay_for_attempt(50);
        assert!(delay <= Duration::from_secs(60));
    }
}
