use std::time::Duration;

use rand::Rng;

/// Consecutive errors beyond this count no longer grow the delay.
const MAX_BACKOFF_STEP: u32 = 6;
const JITTER_RATIO: f64 = 0.10;

/// Delay calculator for retried requests.
///
/// The delay for the `n`th consecutive error (starting at zero) is
/// `min(n, 6)^2` seconds with a uniform ±10% jitter. A success resets the
/// sequence. Only central config polling is retried this way, intake uploads
/// are never resent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    consecutive_errors: u32,
}

impl Backoff {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Returns the delay to wait before the next attempt given the outcome of
    /// the previous one.
    pub fn next_delay(&mut self, had_error: bool) -> Duration {
        if !had_error {
            self.consecutive_errors = 0;
            return Duration::ZERO;
        }

        let step = self.consecutive_errors.min(MAX_BACKOFF_STEP);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);

        if step == 0 {
            return Duration::ZERO;
        }
        let base_ms = f64::from(step * step) * 1000.0;
        let jitter = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        Duration::from_secs_f64(base_ms * (1.0 + jitter) / 1000.0)
    }
}
