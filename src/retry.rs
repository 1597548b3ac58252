//! Retry policy for the locked read-modify-write cycle.
//!
//! The default policy retries forever without sleeping, which suits lock windows measured in
//! fractions of a millisecond. Callers that need bounded latency either cap the number of
//! attempts, set a deadline, or cancel the call through
//! [`Counter::increment_until`](crate::Counter::increment_until).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{config::opt_millis, types::CounterError};

/// Delay inserted between two attempts of the same call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Backoff {
	/// Re-issue immediately, only yielding to the scheduler.
	#[default]
	None,
	/// Sleep the same amount before every retry.
	Fixed {
		#[serde(rename = "delay_ms", with = "crate::config::millis")]
		delay: Duration,
	},
	/// Double the delay on every retry, capped at `max`.
	Exponential {
		#[serde(rename = "initial_ms", with = "crate::config::millis")]
		initial: Duration,
		#[serde(rename = "max_ms", with = "crate::config::millis")]
		max: Duration,
	},
}

impl Backoff {
	/// Delay before retry number `retry` (starting at 1).
	pub fn delay(&self, retry: u32) -> Duration {
		match *self {
			Self::None => Duration::ZERO,
			Self::Fixed { delay } => delay,
			Self::Exponential { initial, max } => {
				let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
				initial.saturating_mul(factor).min(max)
			},
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Total attempts per call, the first one included. `None` retries forever.
	pub max_attempts: Option<u32>,
	/// Wall clock budget per call. `None` has no deadline.
	#[serde(rename = "deadline_ms", with = "opt_millis")]
	pub deadline: Option<Duration>,
	pub backoff: Backoff,
}

impl RetryPolicy {
	/// Retry until success or a non transient error.
	pub fn forever() -> Self {
		Self::default()
	}

	/// Give up after `attempts` attempts.
	pub fn attempts(attempts: u32) -> Self {
		Self { max_attempts: Some(attempts), ..Default::default() }
	}

	/// Give up once `deadline` has elapsed since the first attempt.
	pub fn deadline(deadline: Duration) -> Self {
		Self { deadline: Some(deadline), ..Default::default() }
	}

	pub fn with_backoff(mut self, backoff: Backoff) -> Self {
		self.backoff = backoff;
		self
	}

	pub(crate) fn start(&self) -> RetryState {
		RetryState { policy: *self, attempts: 0, started: Instant::now() }
	}
}

/// Bookkeeping of one call's retries.
#[derive(Debug)]
pub(crate) struct RetryState {
	policy: RetryPolicy,
	attempts: u32,
	started: Instant,
}

impl RetryState {
	/// Number of attempts made so far.
	pub(crate) fn attempts(&self) -> u32 {
		self.attempts
	}

	/// Record one more attempt.
	pub(crate) fn record_attempt(&mut self) {
		self.attempts = self.attempts.saturating_add(1);
	}

	/// Decide whether another attempt is allowed and wait for the backoff delay.
	///
	/// The wait never outlasts the deadline.
	pub(crate) async fn pause(&mut self, key: &str) -> crate::Result<()> {
		if let Some(max) = self.policy.max_attempts {
			if self.attempts >= max {
				return Err(CounterError::RetriesExhausted {
					key: key.to_string(),
					attempts: self.attempts,
				})
			}
		}

		let mut delay = self.policy.backoff.delay(self.attempts);
		if let Some(deadline) = self.policy.deadline {
			let elapsed = self.started.elapsed();
			if elapsed >= deadline {
				return Err(CounterError::Timeout { key: key.to_string(), elapsed })
			}
			delay = delay.min(deadline - elapsed);
		}

		if delay.is_zero() {
			tokio::task::yield_now().await;
		} else {
			tokio::time::sleep(delay).await;
		}

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exponential_backoff_doubles_and_caps() {
		let backoff = Backoff::Exponential {
			initial: Duration::from_millis(2),
			max: Duration::from_millis(10),
		};

		assert_eq!(backoff.delay(1), Duration::from_millis(2));
		assert_eq!(backoff.delay(2), Duration::from_millis(4));
		assert_eq!(backoff.delay(3), Duration::from_millis(8));
		assert_eq!(backoff.delay(4), Duration::from_millis(10));
		assert_eq!(backoff.delay(64), Duration::from_millis(10));
	}

	#[test]
	fn no_backoff_means_no_delay() {
		assert_eq!(Backoff::None.delay(7), Duration::ZERO);
		assert_eq!(
			Backoff::Fixed { delay: Duration::from_millis(3) }.delay(7),
			Duration::from_millis(3)
		);
	}

	#[tokio::test]
	async fn attempts_are_bounded() {
		let mut state = RetryPolicy::attempts(2).start();

		state.record_attempt();
		assert!(state.pause("k").await.is_ok());
		state.record_attempt();
		let err = state.pause("k").await.unwrap_err();

		assert!(matches!(err, CounterError::RetriesExhausted { attempts: 2, .. }));
	}

	#[tokio::test(start_paused = true)]
	async fn deadline_is_enforced() {
		let policy = RetryPolicy::deadline(Duration::from_millis(10))
			.with_backoff(Backoff::Fixed { delay: Duration::from_millis(4) });
		let mut state = policy.start();

		for _ in 0..3 {
			state.record_attempt();
			state.pause("k").await.unwrap();
		}
		state.record_attempt();
		let err = state.pause("k").await.unwrap_err();

		assert!(matches!(err, CounterError::Timeout { .. }));
	}

	#[test]
	fn policy_deserializes() {
		let policy: RetryPolicy = serde_json::from_str(
			r#"{"max_attempts": 5, "backoff": {"kind": "fixed", "delay_ms": 20}}"#,
		)
		.unwrap();

		assert_eq!(policy.max_attempts, Some(5));
		assert_eq!(policy.deadline, None);
		assert_eq!(policy.backoff, Backoff::Fixed { delay: Duration::from_millis(20) });
	}
}
