//! Reconnect policy and backoff calculation.
//!
//! Portable, sync-only building blocks. Timers live in `assess-channel`;
//! this module only answers "how long before attempt N, if at all".

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 2000;
/// Default maximum number of reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Bounded exponential backoff for reconnecting a dropped channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Delay before the first attempt, in ms.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Attempts allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given 1-based attempt, or `None` once the attempt
    /// exceeds `max_attempts` (or for attempt 0).
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(Duration::from_millis(backoff_delay_ms(
            attempt,
            self.base_delay_ms,
        )))
    }
}

/// Exponential backoff: `base_delay_ms * 2^(attempt - 1)`, saturating.
///
/// `attempt` is 1-based; attempt 0 is treated as attempt 1.
#[must_use]
pub fn backoff_delay_ms(attempt: u32, base_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(63);
    base_delay_ms.saturating_mul(1u64 << exponent)
}
