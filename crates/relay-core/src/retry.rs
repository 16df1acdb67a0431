//! Reconnection backoff.
//!
//! The socket client schedules reconnect attempts with capped exponential
//! backoff and no jitter:
//!
//! `delay(n) = min(base * 2^(n-1), max)` for the one-based attempt `n`.
//!
//! - [`BackoffPolicy`]: base delay, cap and maximum attempt count
//! - [`calculate_backoff_delay`]: the bare formula

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Default maximum reconnect attempts.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
/// Default base delay in milliseconds.
pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
/// Default maximum delay in milliseconds.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Capped exponential backoff policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackoffPolicy {
    /// Delay before the first attempt in ms (default: 1000).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay in ms (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Attempts allowed before giving up (default: 10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    DEFAULT_BASE_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    DEFAULT_MAX_DELAY_MS
}
fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the one-based `attempt`, or `None` once `attempt`
    /// exceeds [`BackoffPolicy::max_attempts`].
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Option<u64> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        Some(calculate_backoff_delay(
            attempt,
            self.base_delay_ms,
            self.max_delay_ms,
        ))
    }

    /// Whether another attempt is allowed after `attempts` have been made.
    #[must_use]
    pub fn allows(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Backoff calculation
// ─────────────────────────────────────────────────────────────────────────────

/// Capped exponential delay for a one-based attempt number.
///
/// Attempt `0` is treated as attempt `1`. Large attempt numbers saturate at
/// `max_delay_ms` instead of overflowing.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64, max_delay_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(31);
    base_delay_ms
        .saturating_mul(1u64 << exponent)
        .min(max_delay_ms)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
