use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::{
	config::StoreTimeouts,
	types::{CasToken, StoreError},
};

pub(crate) mod common;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
#[cfg(feature = "rocksdb")]
pub mod rocksdb;

pub use common::counter_from_value;

/// The primitive per-key operations a backing store must offer for [`crate::Counter`] to build
/// a correct increment protocol on top of it.
///
/// # Usage
///
/// Implementations adapt a concrete store (a document database with pessimistic locks, Redis,
/// an embedded database, an in-memory map for tests) to this contract. Every method is a
/// suspension point; none of them may block the runtime thread.
///
/// Values travel as generic JSON documents because most stores do not keep integers as
/// integers. [`crate::Counter`] checks that every value it reads is an exact `i64`.
///
/// [`StoreError::Locked`] and [`StoreError::CasMismatch`] are the only errors the engine
/// treats as transient.
#[async_trait]
pub trait KeyedStore: Send + Sync {
	/// Reads the current value of `key`.
	///
	/// Fails with [`StoreError::NotFound`] if the key does not exist.
	async fn read(&self, key: &str) -> Result<Value, StoreError>;

	/// Atomically creates `key` holding `seed` if it does not exist yet.
	///
	/// Concurrent callers must observe exactly one effective creation. Calling it on an existing
	/// key is not an error and leaves the value untouched.
	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError>;

	/// Reads `key` and takes a pessimistic lock on it for `ttl`.
	///
	/// The returned [`CasToken`] is the only way to write the key until the lock is released
	/// by a successful [`KeyedStore::replace_cas`] or expires on its own.
	///
	/// Fails with [`StoreError::NotFound`] or [`StoreError::Locked`].
	async fn read_and_lock(&self, key: &str, ttl: Duration)
		-> Result<(Value, CasToken), StoreError>;

	/// Replaces the value of `key` if `token` still matches the record, releasing the lock.
	///
	/// Fails with [`StoreError::CasMismatch`] when the record changed since `token` was issued.
	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError>;

	/// Applies store level timeouts. Options that are `None` keep their current value.
	async fn configure(&self, _timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		Ok(())
	}

	/// Releases the connection. Every later call fails with [`StoreError::Closed`].
	async fn close(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S: KeyedStore + ?Sized> KeyedStore for std::sync::Arc<S> {
	async fn read(&self, key: &str) -> Result<Value, StoreError> {
		(**self).read(key).await
	}

	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError> {
		(**self).create_if_absent(key, seed).await
	}

	async fn read_and_lock(
		&self,
		key: &str,
		ttl: Duration,
	) -> Result<(Value, CasToken), StoreError> {
		(**self).read_and_lock(key, ttl).await
	}

	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		(**self).replace_cas(key, value, token).await
	}

	async fn configure(&self, timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		(**self).configure(timeouts).await
	}

	async fn close(&self) -> Result<(), StoreError> {
		(**self).close().await
	}
}
