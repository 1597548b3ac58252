use async_trait::async_trait;
use serde_json::Value;
use std::{
	collections::HashMap,
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};
use tokio::{sync::Mutex, time::Instant};
use tracing::debug;

use crate::{
	config::StoreTimeouts,
	types::{CasToken, StoreError},
};

use super::{common::LockedRecord, KeyedStore};

/// In-process [`KeyedStore`] with real lock expiry and CAS tokens.
///
/// Useful for tests, single process deployments and as the reference behaviour other adapters
/// are expected to match. Lock expiry follows the tokio clock, so paused-time tests can move it
/// forward deterministically.
#[derive(Debug)]
pub struct MemoryStore {
	records: Mutex<HashMap<String, LockedRecord>>,
	timeouts: Mutex<StoreTimeouts>,
	origin: Instant,
	closed: AtomicBool,
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryStore {
	pub fn new() -> Self {
		Self {
			records: Mutex::new(HashMap::new()),
			timeouts: Mutex::new(StoreTimeouts::default()),
			origin: Instant::now(),
			closed: AtomicBool::new(false),
		}
	}

	/// Timeouts applied so far through [`KeyedStore::configure`].
	pub async fn timeouts(&self) -> StoreTimeouts {
		*self.timeouts.lock().await
	}

	/// Removes `key` regardless of its lock state.
	pub async fn remove(&self, key: &str) -> Option<Value> {
		self.records.lock().await.remove(key).map(|record| record.value)
	}

	/// Stores an arbitrary document at `key`, replacing whatever was there.
	pub async fn insert_raw(&self, key: &str, value: Value) {
		self.records.lock().await.insert(
			key.to_string(),
			LockedRecord { value, cas: 1, locked_until_ms: None },
		);
	}

	/// Whether `key` currently carries an unexpired lock.
	pub async fn is_locked(&self, key: &str) -> bool {
		let now = self.now_ms();
		self.records.lock().await.get(key).map_or(false, |record| record.is_locked(now))
	}

	fn now_ms(&self) -> u64 {
		self.origin.elapsed().as_millis() as u64
	}

	fn ensure_open(&self) -> Result<(), StoreError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(StoreError::Closed)
		}
		Ok(())
	}
}

#[async_trait]
impl KeyedStore for MemoryStore {
	async fn read(&self, key: &str) -> Result<Value, StoreError> {
		self.ensure_open()?;

		self.records
			.lock()
			.await
			.get(key)
			.map(|record| record.value.clone())
			.ok_or_else(|| StoreError::NotFound(key.to_string()))
	}

	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError> {
		self.ensure_open()?;

		let mut records = self.records.lock().await;
		if !records.contains_key(key) {
			records.insert(key.to_string(), LockedRecord::new(seed));
			debug!("Created key {} with seed {}", key, seed);
		}

		Ok(())
	}

	async fn read_and_lock(
		&self,
		key: &str,
		ttl: Duration,
	) -> Result<(Value, CasToken), StoreError> {
		self.ensure_open()?;

		let now = self.now_ms();
		let mut records = self.records.lock().await;
		let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;
		let token = record.lock(key, now, ttl)?;

		Ok((record.value.clone(), token))
	}

	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		self.ensure_open()?;

		let mut records = self.records.lock().await;
		let record = records.get_mut(key).ok_or_else(|| StoreError::NotFound(key.to_string()))?;

		record.replace(key, value, token)
	}

	async fn configure(&self, timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		self.ensure_open()?;

		self.timeouts.lock().await.merge(timeouts);
		Ok(())
	}

	async fn close(&self) -> Result<(), StoreError> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(StoreError::Closed)
		}

		self.records.lock().await.clear();
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	const TTL: Duration = Duration::from_millis(100);

	#[tokio::test]
	async fn read_missing_key() {
		let store = MemoryStore::new();
		assert!(matches!(store.read("missing").await, Err(StoreError::NotFound(_))));
		assert!(matches!(store.read_and_lock("missing", TTL).await, Err(StoreError::NotFound(_))));
	}

	#[tokio::test]
	async fn create_if_absent_keeps_existing_value() {
		let store = MemoryStore::new();

		store.create_if_absent("k", 1).await.unwrap();
		store.create_if_absent("k", 50).await.unwrap();

		assert_eq!(store.read("k").await.unwrap(), json!(1));
	}

	#[tokio::test]
	async fn locked_key_rejects_second_lock() {
		let store = MemoryStore::new();
		store.create_if_absent("k", 1).await.unwrap();

		let (value, token) = store.read_and_lock("k", TTL).await.unwrap();
		assert_eq!(value, json!(1));
		assert!(store.is_locked("k").await);
		assert!(matches!(store.read_and_lock("k", TTL).await, Err(StoreError::Locked(_))));

		store.replace_cas("k", 2, token).await.unwrap();
		assert!(!store.is_locked("k").await);
		assert_eq!(store.read("k").await.unwrap(), json!(2));
	}

	#[tokio::test(start_paused = true)]
	async fn lock_expires_after_ttl() {
		let store = MemoryStore::new();
		store.create_if_absent("k", 1).await.unwrap();

		let (_, stale) = store.read_and_lock("k", TTL).await.unwrap();
		tokio::time::advance(TTL + Duration::from_millis(1)).await;
		let (_, fresh) = store.read_and_lock("k", TTL).await.unwrap();

		assert!(matches!(store.replace_cas("k", 9, stale).await, Err(StoreError::CasMismatch(_))));
		store.replace_cas("k", 2, fresh).await.unwrap();
		assert_eq!(store.read("k").await.unwrap(), json!(2));
	}

	#[tokio::test]
	async fn closed_store_rejects_everything() {
		let store = MemoryStore::new();
		store.create_if_absent("k", 1).await.unwrap();
		store.close().await.unwrap();

		assert!(matches!(store.read("k").await, Err(StoreError::Closed)));
		assert!(matches!(store.create_if_absent("k", 1).await, Err(StoreError::Closed)));
		assert!(matches!(store.close().await, Err(StoreError::Closed)));
	}

	#[tokio::test]
	async fn configure_merges_timeouts() {
		let store = MemoryStore::new();
		let first = StoreTimeouts { operation: Some(Duration::from_secs(1)), ..Default::default() };

		store.configure(&first).await.unwrap();
		store.configure(&StoreTimeouts::default()).await.unwrap();

		assert_eq!(store.timeouts().await, first);
	}
}
