//! Classifies failures as retryable/terminal, applies backoff, and routes
//! exhausted jobs to the dead-letter store.

use chrono::{DateTime, Duration, Utc};

/// Backoff schedule parameters: `next = now + min(base * 2^retry_count, cap)
/// +/- U[0, jitter]`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::minutes(5),
            cap: Duration::hours(1),
            jitter: Duration::seconds(30),
        }
    }
}

/// Computes the next `scheduled_for` for a job about to be retried, given
/// its post-increment `retry_count`.
pub fn next_retry_schedule(now: DateTime<Utc>, retry_count: i32, cfg: &BackoffConfig) -> DateTime<Utc> {
    let exp = 2i64.saturating_pow(retry_count.max(0) as u32);
    let raw = cfg.base.checked_mul(exp as i32).unwrap_or(cfg.cap);
    let capped = raw.min(cfg.cap);

    let jitter_ms = cfg.jitter.num_milliseconds().max(0);
    let jitter = if jitter_ms == 0 {
        Duration::zero()
    } else {
        let magnitude = fastrand::i64(0..=jitter_ms);
        let signed = if fastrand::bool() { magnitude } else { -magnitude };
        Duration::milliseconds(signed)
    };

    now + capped + jitter
}

/// The default classification rule applied to harness-caught exceptions
/// (processors that return an explicit `ProcessorOutcome::Failure` already
/// carry their own `retryable` verdict and bypass this).
///
/// Terminal: validation/format/not-found style messages.
/// Retryable: everything else, including network/timeout/connection errors
/// and transient store conflicts.
pub fn classify_uncaught(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    let terminal_markers = [
        "validation",
        "unsupported format",
        "malformed",
        "not found",
        "invalid",
    ];
    !terminal_markers.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = BackoffConfig {
            base: Duration::minutes(5),
            cap: Duration::hours(1),
            jitter: Duration::zero(),
        };
        let now = Utc::now();
        let first = next_retry_schedule(now, 0, &cfg) - now;
        let second = next_retry_schedule(now, 1, &cfg) - now;
        let tenth = next_retry_schedule(now, 10, &cfg) - now;
        assert_eq!(first, Duration::minutes(5));
        assert_eq!(second, Duration::minutes(10));
        assert_eq!(tenth, Duration::hours(1));
    }

    #[test]
    fn classify_uncaught_marks_validation_terminal() {
        assert!(!classify_uncaught("ValidationError: missing field"));
        assert!(!classify_uncaught("unsupported format: .xyz"));
        assert!(classify_uncaught("connection reset by peer"));
        assert!(classify_uncaught("timed out waiting for response"));
    }
}
