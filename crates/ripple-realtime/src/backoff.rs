//! Retry delays with linear backoff and jitter.

use std::time::Duration;

/// Grows 1, 4/3, 5/3, then stays at 2.
pub(crate) fn backoff_coefficient(attempt: u32) -> f64 {
    ((f64::from(attempt) + 2.0) / 3.0).min(2.0)
}

/// Uniform in (0.8, 1.0].
pub(crate) fn jitter_coefficient() -> f64 {
    1.0 - rand::random::<f64>() * 0.2
}

/// Delay before retry number `attempt` (starting at 1).
pub(crate) fn retry_delay(initial: Duration, attempt: u32) -> Duration {
    initial.mul_f64(backoff_coefficient(attempt) * jitter_coefficient())
}
