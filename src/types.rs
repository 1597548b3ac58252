use std::{fmt::Display, time::Duration};

use serde::{Deserialize, Serialize};

/// Opaque version token handed out by [`crate::KeyedStore::read_and_lock`].
///
/// A write carrying a token only succeeds if the record was not replaced since the token was
/// issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CasToken(pub u64);

impl Display for CasToken {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:#x}", self.0)
	}
}

/// Broad classes a [`CounterError`] falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
	/// Contention that outlived the retry budget of the call.
	Transient,
	/// The record changed shape or disappeared in the middle of the protocol.
	Invariant,
	/// Closed engine, bad configuration or a failing store.
	Connection,
	/// Invalid arguments supplied by the caller.
	Caller,
}

#[derive(Debug, thiserror::Error)]
pub enum CounterError {
	/// The counter key is empty.
	EmptyKey,
	/// The engine has been closed.
	Closed,
	/// The key disappeared between initialization and the locked read.
	VanishedKey(String),
	/// The store holds a value that is not an exact 64-bit integer.
	NonIntegral { key: String, value: serde_json::Value },
	/// A single attempt lost the race against another writer.
	Contention(StoreError),
	/// The retry policy gave up.
	RetriesExhausted { key: String, attempts: u32 },
	/// The retry deadline elapsed.
	Timeout { key: String, elapsed: Duration },
	/// The caller cancelled the retry loop.
	Cancelled(String),
	/// Invalid configuration.
	Config(String),
	/// Any non transient store failure.
	Store(#[from] StoreError),
}

impl CounterError {
	pub fn class(&self) -> ErrorClass {
		match self {
			Self::Contention(_) |
			Self::RetriesExhausted { .. } |
			Self::Timeout { .. } |
			Self::Cancelled(_) => ErrorClass::Transient,
			Self::VanishedKey(_) | Self::NonIntegral { .. } => ErrorClass::Invariant,
			Self::Closed | Self::Config(_) | Self::Store(_) => ErrorClass::Connection,
			Self::EmptyKey => ErrorClass::Caller,
		}
	}
}

impl Display for CounterError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::EmptyKey => write!(f, "Counter key must not be empty"),
			Self::Closed => write!(f, "Counter engine is closed"),
			Self::VanishedKey(key) =>
				write!(f, "Key {} vanished after it was initialized", key),
			Self::NonIntegral { key, value } =>
				write!(f, "Store returned a non-integral counter value for {}: {}", key, value),
			Self::Contention(e) => write!(f, "Contention: {}", e),
			Self::RetriesExhausted { key, attempts } =>
				write!(f, "Gave up on {} after {} attempts", key, attempts),
			Self::Timeout { key, elapsed } =>
				write!(f, "Timed out incrementing {} after {:?}", key, elapsed),
			Self::Cancelled(key) => write!(f, "Increment of {} was cancelled", key),
			Self::Config(msg) => write!(f, "Bad configuration: {}", msg),
			Self::Store(e) => write!(f, "{}", e),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	/// The key does not exist.
	NotFound(String),
	/// Another holder owns the lock on the key.
	Locked(String),
	/// The CAS token no longer matches the record.
	CasMismatch(String),
	/// The store handle was closed.
	Closed,
	/// The stored record could not be decoded.
	Parsing(String),
	/// The operation did not complete within the configured operation timeout.
	Timeout(Duration),
	#[cfg(feature = "redis")]
	Redis(#[from] redis::RedisError),
	#[cfg(feature = "rocksdb")]
	RocksDb(#[from] rocksdb::Error),
	/// Any other backend failure.
	Backend(String),
}

impl StoreError {
	/// Contention signals that are expected to clear on retry.
	pub fn is_transient(&self) -> bool {
		matches!(self, Self::Locked(_) | Self::CasMismatch(_))
	}
}

impl Display for StoreError {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::NotFound(key) => write!(f, "Key not found: {}", key),
			Self::Locked(key) => write!(f, "Key is locked: {}", key),
			Self::CasMismatch(key) => write!(f, "CAS mismatch on key: {}", key),
			Self::Closed => write!(f, "Store is closed"),
			Self::Parsing(msg) => write!(f, "Parsing error: {}", msg),
			Self::Timeout(after) => write!(f, "Store operation timed out after {:?}", after),
			#[cfg(feature = "redis")]
			Self::Redis(e) => write!(f, "Redis error: {}", e),
			#[cfg(feature = "rocksdb")]
			Self::RocksDb(e) => write!(f, "RocksDB error: {}", e),
			Self::Backend(msg) => write!(f, "Backend error: {}", msg),
		}
	}
}
