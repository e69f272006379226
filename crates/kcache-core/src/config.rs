// ── Runtime tuning ──
//
// These types describe *how* a controller paces itself and buffers.
// They never touch disk; `kcache-config` builds them from files and env.

use std::time::Duration;

/// Delay policy for re-opening a failed watch session.
///
/// With `initial_delay == max_delay` (the default) retries wait a fixed
/// delay. A larger `max_delay` turns on exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first retry. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on the retry delay. Default: 1s.
    pub max_delay: Duration,

    /// Consecutive failed sessions before the watcher stops retrying
    /// until the next reset. `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            max_retries: None,
        }
    }
}

/// Configuration for a single controller pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// How long the lister waits after a result before listing again.
    pub refresh_period: Duration,
    pub reconnect: ReconnectConfig,
    /// Capacity of the watcher's event channel. Overflow is dropped.
    pub watch_buffer_size: usize,
    /// Capacity of each subscription's event queue. Overflow is dropped.
    pub subscription_buffer_size: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            refresh_period: Duration::from_secs(60),
            reconnect: ReconnectConfig::default(),
            watch_buffer_size: 100,
            subscription_buffer_size: 100,
        }
    }
}

/// Exponential backoff with jitter, clamped to `[initial_delay, max_delay]`.
///
/// `delay = clamp(initial * 2^attempt + jitter)`
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let initial = config.initial_delay.as_secs_f64();
    let max = config.max_delay.as_secs_f64().max(initial);
    let exp = i32::try_from(attempt.min(32)).unwrap_or(32);
    let base = (initial * 2.0_f64.powi(exp)).min(max);

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (base * jitter_factor).clamp(initial, max);

    Duration::from_secs_f64(with_jitter)
}
