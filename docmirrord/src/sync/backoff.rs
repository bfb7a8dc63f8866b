use std::time::Duration;

use rand::Rng;

/// Exponential delay schedule used between conflict retries and before
/// re-flushing a batch that failed to sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    /// Short, jittered waits so two writers racing on one revision do not
    /// retry in lockstep.
    pub fn conflicts() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_secs(2), true)
    }

    /// Spacing of retries for batches whose cycle failed.
    pub fn failed_batches() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30), false)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with_rng(attempt, &mut rand::thread_rng())
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        // Keep at least half of the ceiling so retries still spread out.
        let ceiling_ms = ceiling.as_millis().min(u128::from(u64::MAX)) as u64;
        Duration::from_millis(rng.gen_range(ceiling_ms / 2..=ceiling_ms))
    }

    fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}
