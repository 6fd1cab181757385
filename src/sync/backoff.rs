use std::time::Duration;

use rand::Rng;

/// Exponential backoff with additive jitter, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
	pub initial: Duration,
	pub max: Duration,
	/// Up to this percentage of the base delay is added at random.
	pub jitter_percent: u32,
}

impl Default for BackoffPolicy {
	fn default() -> Self {
		Self {
			initial: Duration::from_secs(1),
			max: Duration::from_secs(300),
			jitter_percent: 25,
		}
	}
}

impl BackoffPolicy {
	/// Delay before retry number `attempt` (1-based), without jitter.
	pub fn base_delay(&self, attempt: u32) -> Duration {
		let exp = attempt.saturating_sub(1).min(31);
		self.initial.saturating_mul(1u32 << exp).min(self.max)
	}

	/// Delay before retry number `attempt` (1-based). Never exceeds `max`.
	pub fn delay(&self, attempt: u32) -> Duration {
		let base = self.base_delay(attempt);
		let max_jitter = base.as_millis() as u64 * u64::from(self.jitter_percent) / 100;
		if max_jitter == 0 {
			return base;
		}
		let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter);
		base.saturating_add(Duration::from_millis(jitter_ms))
			.min(self.max)
	}
}
