use async_trait::async_trait;
use rocksdb::{ErrorKind, MultiThreaded, OptimisticTransactionDB};
use serde_json::Value;
use std::{
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc, Mutex,
	},
	time::Duration,
};
use tracing::{debug, error};

use crate::{
	config::StoreTimeouts,
	types::{CasToken, StoreError},
};

use super::{
	common::{decode_record, encode_record, now_ms, with_timeout, LockedRecord},
	KeyedStore,
};

type Db = OptimisticTransactionDB<MultiThreaded>;

/// RocksDB implementation of [`KeyedStore`].
///
/// Every key holds a JSON encoded record with the counter value, its CAS and the lock deadline.
/// Each primitive runs as one optimistic transaction on the blocking thread pool; a commit
/// conflict is reported as the matching contention error.
pub struct RocksDbStore {
	db: Arc<Db>,
	timeouts: Mutex<StoreTimeouts>,
	closed: AtomicBool,
}

impl RocksDbStore {
	/// Creates a new `RocksDbStore` with the provided database instance.
	pub fn new(db: Arc<Db>) -> Self {
		Self { db, timeouts: Mutex::new(StoreTimeouts::default()), closed: AtomicBool::new(false) }
	}

	/// Opens the database at `ROCKSDB_PATH`, defaulting to `rocksdb_data`.
	pub fn new_default() -> Result<Self, StoreError> {
		let path = std::env::var("ROCKSDB_PATH").unwrap_or_else(|_| "rocksdb_data".to_string());
		Self::open(path)
	}

	pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
		let db = Db::open_default(path).map_err(StoreError::RocksDb)?;
		Ok(Self::new(Arc::new(db)))
	}

	fn operation_timeout(&self) -> Option<Duration> {
		self.timeouts.lock().map_or(None, |timeouts| timeouts.operation)
	}

	/// Runs `f` against the database on the blocking pool.
	async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&Db) -> Result<T, StoreError> + Send + 'static,
	{
		if self.closed.load(Ordering::Acquire) {
			return Err(StoreError::Closed)
		}

		let db = self.db.clone();
		let task = async move {
			tokio::task::spawn_blocking(move || f(&db))
				.await
				.map_err(|e| StoreError::Backend(e.to_string()))?
		};

		with_timeout(self.operation_timeout(), task).await
	}
}

fn is_conflict(e: &rocksdb::Error) -> bool {
	matches!(e.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
}

#[async_trait]
impl KeyedStore for RocksDbStore {
	async fn read(&self, key: &str) -> Result<Value, StoreError> {
		let key = key.to_string();
		self.blocking(move |db| match db.get(key.as_bytes())? {
			Some(raw) => Ok(decode_record(&raw)?.value),
			None => Err(StoreError::NotFound(key)),
		})
		.await
	}

	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError> {
		let key = key.to_string();
		self.blocking(move |db| {
			let txn = db.transaction();
			if txn.get_for_update(key.as_bytes(), true)?.is_some() {
				return Ok(())
			}

			txn.put(key.as_bytes(), encode_record(&LockedRecord::new(seed))?)?;
			match txn.commit() {
				Ok(()) => {
					debug!("Created key {} with seed {}", key, seed);
					Ok(())
				},
				// a concurrent creator won
				Err(e) if is_conflict(&e) => match db.get(key.as_bytes())? {
					Some(_) => Ok(()),
					None => Err(StoreError::RocksDb(e)),
				},
				Err(e) => {
					error!("Failed to create key {}: {}", key, e);
					Err(StoreError::RocksDb(e))
				},
			}
		})
		.await
	}

	async fn read_and_lock(
		&self,
		key: &str,
		ttl: Duration,
	) -> Result<(Value, CasToken), StoreError> {
		let key = key.to_string();
		self.blocking(move |db| {
			let txn = db.transaction();
			let raw = txn
				.get_for_update(key.as_bytes(), true)?
				.ok_or_else(|| StoreError::NotFound(key.clone()))?;
			let mut record = decode_record(&raw)?;
			let token = record.lock(&key, now_ms(), ttl)?;

			txn.put(key.as_bytes(), encode_record(&record)?)?;
			match txn.commit() {
				Ok(()) => Ok((record.value, token)),
				Err(e) if is_conflict(&e) => Err(StoreError::Locked(key)),
				Err(e) => Err(StoreError::RocksDb(e)),
			}
		})
		.await
	}

	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		let key = key.to_string();
		self.blocking(move |db| {
			let txn = db.transaction();
			let raw = txn
				.get_for_update(key.as_bytes(), true)?
				.ok_or_else(|| StoreError::NotFound(key.clone()))?;
			let mut record = decode_record(&raw)?;
			record.replace(&key, value, token)?;

			txn.put(key.as_bytes(), encode_record(&record)?)?;
			match txn.commit() {
				Ok(()) => Ok(()),
				Err(e) if is_conflict(&e) => Err(StoreError::CasMismatch(key)),
				Err(e) => Err(StoreError::RocksDb(e)),
			}
		})
		.await
	}

	async fn configure(&self, timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		let mut current =
			self.timeouts.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
		current.merge(timeouts);
		debug!("Applied store timeouts {:?}", *current);

		Ok(())
	}

	async fn close(&self) -> Result<(), StoreError> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(StoreError::Closed)
		}

		let db = self.db.clone();
		tokio::task::spawn_blocking(move || db.flush_wal(true))
			.await
			.map_err(|e| StoreError::Backend(e.to_string()))??;

		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	fn temp_store() -> (tempfile::TempDir, RocksDbStore) {
		let dir = tempfile::tempdir().unwrap();
		let store = RocksDbStore::open(dir.path()).unwrap();
		(dir, store)
	}

	#[tokio::test]
	async fn create_lock_and_replace() {
		let (_dir, store) = temp_store();
		assert!(matches!(store.read("k").await, Err(StoreError::NotFound(_))));

		store.create_if_absent("k", 1).await.unwrap();
		store.create_if_absent("k", 9).await.unwrap();
		assert_eq!(store.read("k").await.unwrap(), json!(1));

		let (value, token) = store.read_and_lock("k", Duration::from_secs(5)).await.unwrap();
		assert_eq!(value, json!(1));
		assert!(matches!(
			store.read_and_lock("k", Duration::from_secs(5)).await,
			Err(StoreError::Locked(_))
		));

		store.replace_cas("k", 2, token).await.unwrap();
		assert_eq!(store.read("k").await.unwrap(), json!(2));
		assert!(matches!(store.replace_cas("k", 3, token).await, Err(StoreError::CasMismatch(_))));
	}

	#[tokio::test]
	async fn closed_store() {
		let (_dir, store) = temp_store();
		store.close().await.unwrap();

		assert!(matches!(store.read("k").await, Err(StoreError::Closed)));
		assert!(matches!(store.close().await, Err(StoreError::Closed)));
	}
}
