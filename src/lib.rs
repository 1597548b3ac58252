//! Distributed monotonic counters with rollover, built on top of any keyed store that offers a
//! pessimistic lock with TTL and compare-and-swap writes.
//!
//! Many stores only expose primitive per-key operations: read, atomic create-if-absent,
//! get-and-lock and CAS replace. A counter that wraps back to its initial value once it exceeds
//! a ceiling cannot be expressed with a single atomic increment, so this crate composes those
//! primitives into an increment protocol that stays correct with any number of concurrent
//! callers, inside one process or spread across many.
//!
//! Central to the crate is the [`Counter`] engine. It owns one [`KeyedStore`] handle and for
//! every [`Counter::increment`]:
//!
//! 1. creates the key with [`CounterConfig::initial`] if it does not exist yet. The creating call
//!    returns `None`, it does not count as an increment;
//! 2. reads the value while taking a short lived lock, receiving a [`CasToken`];
//! 3. adds the step and wraps to `initial` if the result exceeds the rollover;
//! 4. writes the result back with the token.
//!
//! Lock contention and stale tokens are retried under the [`RetryPolicy`] of the engine, which
//! by default retries forever. Every other failure is returned as a [`CounterError`].
//!
//! The crate ships a [`MemoryStore`] and, behind the `rocksdb` and `redis` features, adapters for
//! RocksDB and Redis. Any other store can be plugged in by implementing [`KeyedStore`].
//!
//! # Example
//!
//! ```ignore
//! use rollover_counter::{Counter, CounterConfig, IncrementOptions, MemoryStore};
//!
//! #[tokio::main]
//! async fn main() -> rollover_counter::Result<()> {
//!     // Counts 1..=99 and starts over.
//!     let counter = Counter::new(MemoryStore::new(), CounterConfig::new(1, 99))?;
//!
//!     // First access creates the key, nothing is incremented yet.
//!     assert_eq!(counter.increment("invoice").await?, None);
//!     assert_eq!(counter.fetch_current("invoice").await?, 1);
//!
//!     assert_eq!(counter.increment("invoice").await?, Some(2));
//!
//!     // A tighter ceiling for this call only.
//!     let opts = IncrementOptions::with_rollover(2);
//!     assert_eq!(counter.increment_with("invoice", opts).await?, Some(1));
//!
//!     counter.close().await
//! }
//! ```

pub mod architecture;
pub mod config;
mod counter;
pub mod retry;
pub mod storage;
pub mod types;

#[cfg(test)]
mod mock;

pub use config::{CounterConfig, IncrementOptions, Step, StoreTimeouts};
pub use counter::Counter;
pub use retry::{Backoff, RetryPolicy};
pub use storage::{memory::MemoryStore, KeyedStore};
pub use types::{CasToken, CounterError, ErrorClass, StoreError};

pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, CounterError>;
