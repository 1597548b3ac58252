// common.rs

use std::{
	future::Future,
	time::{Duration, SystemTime, UNIX_EPOCH},
};

use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CasToken, StoreError};

/// Interprets a stored document as a counter value.
///
/// Stores commonly hand numbers back as floating point. Only values that round-trip exactly to
/// an `i64` are accepted, anything else (fractions, out of range numbers, strings) yields `None`.
pub fn counter_from_value(value: &Value) -> Option<i64> {
	let Value::Number(number) = value else { return None };
	if let Some(v) = number.as_i64() {
		return Some(v)
	}

	let float = number.as_f64()?;
	if float.fract() != 0.0 {
		return None
	}
	let v = float.to_i64()?;
	(v as f64 == float).then_some(v)
}

/// Milliseconds since the unix epoch, used as lock clock by persistent stores.
pub(crate) fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
}

/// Runs `fut`, giving up after `timeout` when one is configured.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, StoreError>
where
	F: Future<Output = Result<T, StoreError>>,
{
	match timeout {
		Some(after) =>
			tokio::time::timeout(after, fut).await.map_err(|_| StoreError::Timeout(after))?,
		None => fut.await,
	}
}

pub(crate) fn encode_record(record: &LockedRecord) -> Result<Vec<u8>, StoreError> {
	serde_json::to_vec(record).map_err(|e| StoreError::Parsing(e.to_string()))
}

pub(crate) fn decode_record(raw: &[u8]) -> Result<LockedRecord, StoreError> {
	serde_json::from_slice(raw).map_err(|e| StoreError::Parsing(e.to_string()))
}

/// A counter record together with its lock state, as kept by stores that have no native
/// pessimistic locking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct LockedRecord {
	pub value: Value,
	pub cas: u64,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub locked_until_ms: Option<u64>,
}

impl LockedRecord {
	pub fn new(seed: i64) -> Self {
		Self { value: Value::from(seed), cas: 1, locked_until_ms: None }
	}

	pub fn is_locked(&self, now_ms: u64) -> bool {
		self.locked_until_ms.map_or(false, |until| until > now_ms)
	}

	/// Takes the lock, bumping the CAS so that tokens issued earlier stop matching.
	pub fn lock(&mut self, key: &str, now_ms: u64, ttl: Duration) -> Result<CasToken, StoreError> {
		if self.is_locked(now_ms) {
			return Err(StoreError::Locked(key.to_string()))
		}

		self.cas = self.cas.wrapping_add(1);
		self.locked_until_ms = Some(now_ms.saturating_add(ttl.as_millis() as u64));

		Ok(CasToken(self.cas))
	}

	/// Writes `value` if `token` is current, releasing the lock.
	pub fn replace(&mut self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		if self.cas != token.0 {
			return Err(StoreError::CasMismatch(key.to_string()))
		}

		self.value = Value::from(value);
		self.cas = self.cas.wrapping_add(1);
		self.locked_until_ms = None;

		Ok(())
	}
}
