// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Job-level retry budget and backoff.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often, and how patiently, a job retries a failed executor attempt.
///
/// Attempt `k` (1-based) waits `initial_delay_ms * multiplier^(k-1)`,
/// capped at `max_delay_ms`, before resubmitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Fixed short delays, for tests and local runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based; `0` is treated as `1`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        #[allow(clippy::cast_precision_loss)] // millisecond delays stay far below 2^52
        let scaled = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        #[allow(clippy::cast_precision_loss)]
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_secs_f64(capped.max(0.0) / 1000.0)
    }

    /// Whether another attempt is allowed after `retries_so_far` retries.
    pub const fn allows_retry(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }
}
