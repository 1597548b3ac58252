use std::{
	collections::HashMap,
	sync::atomic::{AtomicBool, AtomicU32, Ordering},
	time::Duration,
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{
	config::StoreTimeouts,
	storage::KeyedStore,
	types::{CasToken, StoreError},
};

/// Store double with scripted failures and per primitive call counters.
///
/// Locks are not modelled: `read_and_lock` hands out the record version as token and
/// `replace_cas` only compares versions.
#[derive(Default)]
pub struct ScriptedStore {
	records: Mutex<HashMap<String, (Value, u64)>>,
	/// Number of upcoming `read_and_lock` calls that report [`StoreError::Locked`].
	pub lock_failures: AtomicU32,
	/// Number of upcoming `replace_cas` calls that report [`StoreError::CasMismatch`].
	pub cas_failures: AtomicU32,
	/// `read_and_lock` reports [`StoreError::NotFound`] for existing keys.
	pub vanish_on_lock: AtomicBool,
	/// `replace_cas` fails with a non transient backend error.
	pub broken_writes: AtomicBool,
	pub reads: AtomicU32,
	pub creates: AtomicU32,
	pub locks: AtomicU32,
	pub writes: AtomicU32,
	pub configures: AtomicU32,
	pub closed: AtomicBool,
}

impl ScriptedStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn failing_cas(times: u32) -> Self {
		let store = Self::new();
		store.cas_failures.store(times, Ordering::SeqCst);
		store
	}

	pub fn failing_locks(times: u32) -> Self {
		let store = Self::new();
		store.lock_failures.store(times, Ordering::SeqCst);
		store
	}

	pub async fn seed(&self, key: &str, value: Value) {
		self.records.lock().await.insert(key.to_string(), (value, 1));
	}

	pub async fn value(&self, key: &str) -> Option<Value> {
		self.records.lock().await.get(key).map(|(value, _)| value.clone())
	}

	fn take(counter: &AtomicU32) -> bool {
		counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok()
	}
}

#[async_trait]
impl KeyedStore for ScriptedStore {
	async fn read(&self, key: &str) -> Result<Value, StoreError> {
		self.reads.fetch_add(1, Ordering::SeqCst);
		self.value(key).await.ok_or_else(|| StoreError::NotFound(key.to_string()))
	}

	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError> {
		self.creates.fetch_add(1, Ordering::SeqCst);
		self.records.lock().await.entry(key.to_string()).or_insert((Value::from(seed), 1));
		Ok(())
	}

	async fn read_and_lock(
		&self,
		key: &str,
		_ttl: Duration,
	) -> Result<(Value, CasToken), StoreError> {
		self.locks.fetch_add(1, Ordering::SeqCst);
		if self.vanish_on_lock.load(Ordering::SeqCst) {
			return Err(StoreError::NotFound(key.to_string()))
		}
		if Self::take(&self.lock_failures) {
			return Err(StoreError::Locked(key.to_string()))
		}

		self.records
			.lock()
			.await
			.get(key)
			.map(|(value, version)| (value.clone(), CasToken(*version)))
			.ok_or_else(|| StoreError::NotFound(key.to_string()))
	}

	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		self.writes.fetch_add(1, Ordering::SeqCst);
		if self.broken_writes.load(Ordering::SeqCst) {
			return Err(StoreError::Backend("disk on fire".to_string()))
		}

		let mut records = self.records.lock().await;
		let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
		if Self::take(&self.cas_failures) {
			// somebody else got there first
			record.1 += 1;
		}
		if record.1 != token.0 {
			return Err(StoreError::CasMismatch(key.to_string()))
		}

		*record = (Value::from(value), record.1 + 1);
		Ok(())
	}

	async fn configure(&self, _timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		self.configures.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn close(&self) -> Result<(), StoreError> {
		self.closed.store(true, Ordering::SeqCst);
		Ok(())
	}
}
