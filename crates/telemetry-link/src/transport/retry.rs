use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnect policy knob. Correctness of the rest of the link never depends
/// on reconnection actually happening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
	pub enabled: bool,
	pub initial_delay: Duration,
	pub max_delay: Duration,
	pub backoff_multiplier: f64,
	/// Consecutive failed attempts before giving up; `None` retries forever.
	pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			initial_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(60),
			backoff_multiplier: 1.5,
			max_attempts: None,
		}
	}
}

impl ReconnectConfig {
	#[must_use]
	pub fn disabled() -> Self {
		Self {
			enabled: false,
			..Self::default()
		}
	}
}

pub struct RetryPolicy {
	config: ReconnectConfig,
	consecutive_failures: u32,
	current_delay: Duration,
}

impl RetryPolicy {
	#[must_use]
	pub fn new(config: ReconnectConfig) -> Self {
		let current_delay = config.initial_delay;
		Self {
			config,
			consecutive_failures: 0,
			current_delay,
		}
	}

	/// Delay before the next attempt, or `None` when the session should stay closed.
	pub fn next_delay(&mut self) -> Option<Duration> {
		if !self.config.enabled {
			return None;
		}

		self.consecutive_failures += 1;
		if self.config.max_attempts.is_some_and(|max| self.consecutive_failures > max) {
			tracing::error!("Giving up after {} consecutive reconnect attempts", self.consecutive_failures - 1);
			return None;
		}

		let delay = self.current_delay;
		#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
		let next = Duration::from_millis((self.current_delay.as_millis() as f64 * self.config.backoff_multiplier) as u64);
		self.current_delay = next.min(self.config.max_delay);

		Some(delay)
	}

	pub fn reset(&mut self) {
		self.consecutive_failures = 0;
		self.current_delay = self.config.initial_delay;
	}

	#[must_use]
	pub const fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(max_attempts: Option<u32>) -> ReconnectConfig {
		ReconnectConfig {
			enabled: true,
			initial_delay: Duration::from_millis(100),
			max_delay: Duration::from_millis(300),
			backoff_multiplier: 2.0,
			max_attempts,
		}
	}

	#[test]
	fn backoff_grows_until_ceiling() {
		let mut policy = RetryPolicy::new(config(None));
		let delays: Vec<_> = (0..4).map(|_| policy.next_delay().unwrap()).collect();
		assert_eq!(
			delays,
			vec![Duration::from_millis(100), Duration::from_millis(200), Duration::from_millis(300), Duration::from_millis(300)]
		);
	}

	#[test]
	fn reset_restores_initial_delay() {
		let mut policy = RetryPolicy::new(config(None));
		policy.next_delay();
		policy.next_delay();
		policy.reset();
		assert_eq!(policy.consecutive_failures(), 0);
		assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
	}

	#[test]
	fn gives_up_after_max_attempts() {
		let mut policy = RetryPolicy::new(config(Some(2)));
		assert!(policy.next_delay().is_some());
		assert!(policy.next_delay().is_some());
		assert_eq!(policy.next_delay(), None);
	}

	#[test]
	fn disabled_policy_never_retries() {
		let mut policy = RetryPolicy::new(ReconnectConfig::disabled());
		assert_eq!(policy.next_delay(), None);
	}
}
