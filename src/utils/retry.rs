//! Backoff builders.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker dials.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Attempts: `attempts` in total (at least one)
/// - Jitter enabled
pub fn dial_backoff(attempts: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}
