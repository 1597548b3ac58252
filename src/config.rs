//! Engine and store configuration.
//!
//! [`CounterConfig`] drives the increment protocol itself while [`StoreTimeouts`] is passed
//! through untouched to the [`KeyedStore`](crate::KeyedStore) via
//! [`Counter::configure`](crate::Counter::configure).

use std::time::Duration;

use bounded_integer::BoundedU64;
use serde::{Deserialize, Serialize};

use crate::{retry::RetryPolicy, types::CounterError};

/// Increment step. Zero is not a step.
pub type Step = BoundedU64<1, { u64::MAX }>;

pub const DEFAULT_STEP: Step = match Step::new(1) {
	Some(step) => step,
	None => panic!("1 is a valid step"),
};

/// Default first value of a counter and the value it wraps back to.
pub const DEFAULT_INITIAL: i64 = 1;
/// Default ceiling of a counter.
pub const DEFAULT_ROLLOVER: u64 = 999;
/// Default time a pessimistic lock is held before the store releases it on its own.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(1);

/// Parameters of the increment protocol.
///
/// Deserializes from the JSON shape used by counter services, where every field is optional:
///
/// ```json
/// { "initial": 1, "rollover": 99, "step": 1, "lock_ttl_ms": 500 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CounterConfig {
	/// First value of a freshly created counter and the value it resets to on rollover.
	pub initial: i64,
	/// Ceiling of the counter. A candidate value greater than this resets to `initial`.
	pub rollover: u64,
	#[serde(with = "step_serde")]
	pub step: Step,
	/// How long the store keeps the pessimistic lock taken by the locked read.
	///
	/// Too small causes spurious contention retries, too large stalls other writers when a
	/// holder dies mid-cycle.
	#[serde(rename = "lock_ttl_ms", with = "millis")]
	pub lock_ttl: Duration,
	/// When `false` the counter grows without bound and `rollover` is ignored.
	pub use_rollover_check: bool,
	pub retry: RetryPolicy,
}

impl Default for CounterConfig {
	fn default() -> Self {
		Self {
			initial: DEFAULT_INITIAL,
			rollover: DEFAULT_ROLLOVER,
			step: DEFAULT_STEP,
			lock_ttl: DEFAULT_LOCK_TTL,
			use_rollover_check: true,
			retry: RetryPolicy::default(),
		}
	}
}

impl CounterConfig {
	pub fn new(initial: i64, rollover: u64) -> Self {
		Self { initial, rollover, ..Default::default() }
	}

	pub fn with_step(mut self, step: Step) -> Self {
		self.step = step;
		self
	}

	pub fn with_lock_ttl(mut self, lock_ttl: Duration) -> Self {
		self.lock_ttl = lock_ttl;
		self
	}

	pub fn with_rollover_check(mut self, enabled: bool) -> Self {
		self.use_rollover_check = enabled;
		self
	}

	pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
		self.retry = retry;
		self
	}

	/// Parse a JSON configuration document. Unknown fields (connection strings, bucket names,
	/// credentials) are ignored.
	pub fn from_json(raw: &[u8]) -> crate::Result<Self> {
		let config: Self =
			serde_json::from_slice(raw).map_err(|e| CounterError::Config(e.to_string()))?;
		config.validate()?;
		Ok(config)
	}

	/// Checks the invariants the increment protocol relies on.
	pub fn validate(&self) -> crate::Result<()> {
		if self.lock_ttl.is_zero() {
			return Err(CounterError::Config("lock_ttl must be greater than zero".to_string()))
		}
		if self.use_rollover_check {
			validate_bounds(self.initial, self.rollover)?;
		}
		if self.retry.max_attempts == Some(0) {
			return Err(CounterError::Config("retry.max_attempts must be at least 1".to_string()))
		}

		Ok(())
	}
}

pub(crate) fn validate_bounds(initial: i64, rollover: u64) -> crate::Result<()> {
	if i128::from(initial) > i128::from(rollover) {
		return Err(CounterError::Config(format!(
			"initial ({}) must not exceed rollover ({})",
			initial, rollover
		)))
	}

	Ok(())
}

/// Per call overrides of [`CounterConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementOptions {
	/// Overrides [`CounterConfig::rollover`] for this call only.
	pub rollover: Option<u64>,
	/// Overrides [`CounterConfig::step`] for this call only.
	pub step: Option<Step>,
}

impl IncrementOptions {
	pub fn with_rollover(rollover: u64) -> Self {
		Self { rollover: Some(rollover), ..Default::default() }
	}
}

/// Store level timeouts.
///
/// Every option is independent; `None` means "leave whatever the store currently uses".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreTimeouts {
	#[serde(rename = "operation_timeout_ms", with = "opt_millis")]
	pub operation: Option<Duration>,
	#[serde(rename = "bulk_operation_timeout_ms", with = "opt_millis")]
	pub bulk_operation: Option<Duration>,
	#[serde(rename = "durability_timeout_ms", with = "opt_millis")]
	pub durability: Option<Duration>,
	#[serde(rename = "lock_poll_timeout_ms", with = "opt_millis")]
	pub lock_poll: Option<Duration>,
	#[serde(rename = "view_timeout_ms", with = "opt_millis")]
	pub view: Option<Duration>,
	#[serde(rename = "query_timeout_ms", with = "opt_millis")]
	pub query: Option<Duration>,
	#[serde(rename = "analytics_timeout_ms", with = "opt_millis")]
	pub analytics: Option<Duration>,
}

impl StoreTimeouts {
	pub fn is_empty(&self) -> bool {
		*self == Self::default()
	}

	/// Overwrite the options that are set in `other`, keep the rest.
	pub fn merge(&mut self, other: &StoreTimeouts) {
		fn pick(current: &mut Option<Duration>, update: Option<Duration>) {
			if update.is_some() {
				*current = update;
			}
		}

		pick(&mut self.operation, other.operation);
		pick(&mut self.bulk_operation, other.bulk_operation);
		pick(&mut self.durability, other.durability);
		pick(&mut self.lock_poll, other.lock_poll);
		pick(&mut self.view, other.view);
		pick(&mut self.query, other.query);
		pick(&mut self.analytics, other.analytics);
	}
}

pub(crate) mod millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.as_millis() as u64)
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_millis(u64::deserialize(deserializer)?))
	}
}

pub(crate) mod opt_millis {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		value: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match value {
			Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
	}
}

mod step_serde {
	use serde::{de::Error, Deserialize, Deserializer, Serializer};

	use super::Step;

	pub fn serialize<S: Serializer>(value: &Step, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(value.get())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Step, D::Error> {
		let raw = u64::deserialize(deserializer)?;
		Step::new(raw).ok_or_else(|| D::Error::custom("step must be at least 1"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_json_ignores_connection_fields() {
		let raw = br#"{
			"address": "localhost",
			"bucket": "increment",
			"bucket_password": "",
			"rollover": 99,
			"initial": 1
		}"#;
		let config = CounterConfig::from_json(raw).unwrap();

		assert_eq!(config.rollover, 99);
		assert_eq!(config.initial, 1);
		assert_eq!(config.step.get(), 1);
		assert_eq!(config.lock_ttl, DEFAULT_LOCK_TTL);
		assert!(config.use_rollover_check);
	}

	#[test]
	fn from_json_rejects_zero_step() {
		let err = CounterConfig::from_json(br#"{"step": 0}"#).unwrap_err();
		assert!(matches!(err, CounterError::Config(_)));
	}

	#[test]
	fn initial_above_rollover_is_rejected() {
		assert!(CounterConfig::new(100, 99).validate().is_err());
		assert!(CounterConfig::new(100, 99).with_rollover_check(false).validate().is_ok());
		assert!(CounterConfig::new(-5, 0).validate().is_ok());
	}

	#[test]
	fn zero_lock_ttl_is_rejected() {
		let config = CounterConfig::default().with_lock_ttl(Duration::ZERO);
		assert!(config.validate().is_err());
	}

	#[test]
	fn merge_keeps_unset_timeouts() {
		let mut current = StoreTimeouts {
			operation: Some(Duration::from_millis(250)),
			query: Some(Duration::from_secs(10)),
			..Default::default()
		};

		current.merge(&StoreTimeouts::default());
		assert_eq!(current.operation, Some(Duration::from_millis(250)));
		assert_eq!(current.query, Some(Duration::from_secs(10)));

		current.merge(&StoreTimeouts {
			query: Some(Duration::from_secs(2)),
			analytics: Some(Duration::from_secs(30)),
			..Default::default()
		});
		assert_eq!(current.operation, Some(Duration::from_millis(250)));
		assert_eq!(current.query, Some(Duration::from_secs(2)));
		assert_eq!(current.analytics, Some(Duration::from_secs(30)));
	}

	#[test]
	fn timeouts_deserialize_from_millis() {
		let timeouts: StoreTimeouts =
			serde_json::from_str(r#"{"operation_timeout_ms": 1500, "view_timeout_ms": null}"#)
				.unwrap();
		assert_eq!(timeouts.operation, Some(Duration::from_millis(1500)));
		assert_eq!(timeouts.view, None);
		assert!(!timeouts.is_empty());
	}
}
