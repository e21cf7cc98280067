//! Reconnection delay schedule.
//!
//! ```text
//! attempt    delay (base = 1s)
//! ─────────────────────────────
//!    1           1s
//!    2           2s
//!    3           4s
//!    4           8s
//!    5          16s
//!  > max     give up until an explicit reconnect
//! ```

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before reconnect attempt `attempt` (1-based): `base * 2^(attempt - 1)`.
    ///
    /// Returns `None` past the attempt cap.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        Some(self.base.saturating_mul(factor))
    }

    /// The full schedule, one delay per allowed attempt.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(|attempt| self.delay_for(attempt))
    }
}
