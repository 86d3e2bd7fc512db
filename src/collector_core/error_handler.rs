use rand::Rng;
use std::time::Duration;

/// Exponential backoff with full jitter.
///
/// The n-th delay is drawn uniformly from `[0, min(max, initial * 2^n)]`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            current_attempt: 0,
        }
    }

    /// Upper bound of the next delay, without jitter
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.current_attempt.min(31));
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.current_attempt = self.current_attempt.saturating_add(1);

        let ceiling_ms = ceiling.as_millis() as u64;
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling_ms));

        log::debug!(
            "⏳ Backoff attempt {}: {}ms (ceiling {}ms)",
            self.current_attempt,
            delay.as_millis(),
            ceiling_ms
        );
        delay
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
