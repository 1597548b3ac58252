use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::{
	config::{validate_bounds, CounterConfig, IncrementOptions, StoreTimeouts},
	retry::RetryState,
	storage::{counter_from_value, KeyedStore},
	types::{CounterError, StoreError},
	Result,
};

/// How a call reacts to contention.
#[derive(Debug, Clone, Copy)]
enum Mode<'a> {
	/// One attempt, contention is reported to the caller.
	Once,
	/// Retry under [`CounterConfig::retry`].
	Retry,
	/// Retry under [`CounterConfig::retry`] until the token fires.
	RetryUntil(&'a CancellationToken),
}

/// Wrap decision and step resolved for a single call.
#[derive(Debug, Clone, Copy)]
struct Plan {
	step: u64,
	/// `None` when the counter grows without a ceiling.
	rollover: Option<u64>,
}

/// The counter engine.
///
/// Owns one [`KeyedStore`] handle and composes its primitives into a race free increment with
/// rollover. A single `Counter` can be shared between tasks through an `Arc`, and any number of
/// engines in independent processes may work against the same store.
///
/// ```ignore
/// use rollover_counter::{Counter, CounterConfig, MemoryStore};
///
/// let counter = Counter::new(MemoryStore::new(), CounterConfig::new(1, 99))?;
///
/// // The call that creates the key does not count as an increment.
/// assert_eq!(counter.increment("orders").await?, None);
/// assert_eq!(counter.increment("orders").await?, Some(2));
/// ```
pub struct Counter<S: KeyedStore> {
	store: S,
	config: CounterConfig,
	/// Serializes key creation within this process.
	init_lock: Mutex<()>,
	closed: AtomicBool,
}

impl<S: KeyedStore> Counter<S> {
	/// Creates an engine on top of `store`.
	///
	/// Fails with [`CounterError::Config`] if `config` does not pass
	/// [`CounterConfig::validate`].
	pub fn new(store: S, config: CounterConfig) -> Result<Self> {
		config.validate()?;

		Ok(Self { store, config, init_lock: Mutex::new(()), closed: AtomicBool::new(false) })
	}

	pub fn config(&self) -> &CounterConfig {
		&self.config
	}

	pub fn store(&self) -> &S {
		&self.store
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Increments `key` using the configured rollover and step.
	///
	/// Returns `None` when the call created the key, in which case the key holds
	/// [`CounterConfig::initial`] and no increment happened. Otherwise returns the value that was
	/// written.
	///
	/// Contention is retried according to [`CounterConfig::retry`], which by default never
	/// gives up.
	pub async fn increment(&self, key: &str) -> Result<Option<i64>> {
		self.increment_with(key, IncrementOptions::default()).await
	}

	/// Same as [`Counter::increment`] with per call overrides.
	///
	/// An explicit rollover always enables the wrap check for this call, even if the engine was
	/// configured without it.
	#[instrument(skip(self), fields(key = %key))]
	pub async fn increment_with(&self, key: &str, options: IncrementOptions) -> Result<Option<i64>> {
		self.run(key, options, Mode::Retry).await
	}

	/// Same as [`Counter::increment_with`], but gives up with [`CounterError::Cancelled`] once
	/// `cancel` fires.
	///
	/// Cancellation is observed between attempts. An attempt that already reached the store is
	/// allowed to finish so that a successful write is never reported as cancelled.
	#[instrument(skip(self, cancel), fields(key = %key))]
	pub async fn increment_until(
		&self,
		key: &str,
		options: IncrementOptions,
		cancel: &CancellationToken,
	) -> Result<Option<i64>> {
		self.run(key, options, Mode::RetryUntil(cancel)).await
	}

	/// Makes a single attempt at incrementing `key`.
	///
	/// Contention is returned as [`CounterError::Contention`] instead of being retried.
	#[instrument(skip(self), fields(key = %key))]
	pub async fn try_increment(&self, key: &str, options: IncrementOptions) -> Result<Option<i64>> {
		self.run(key, options, Mode::Once).await
	}

	/// Increments `key` and returns the value it now holds.
	///
	/// Unlike [`Counter::increment`] the creating call yields a value too: the seed the store
	/// settled on.
	pub async fn next_value(&self, key: &str, options: IncrementOptions) -> Result<i64> {
		match self.increment_with(key, options).await? {
			Some(value) => Ok(value),
			None => self.fetch_current(key).await,
		}
	}

	/// Plain read of the counter, outside of the lock protocol.
	#[instrument(skip(self), fields(key = %key))]
	pub async fn fetch_current(&self, key: &str) -> Result<i64> {
		self.check(key)?;

		let value = self.store.read(key).await.map_err(store_error)?;
		counter_from_value(&value)
			.ok_or_else(|| CounterError::NonIntegral { key: key.to_string(), value })
	}

	/// Forwards store timeouts. Options left unset keep their current value.
	#[instrument(skip(self))]
	pub async fn configure(&self, timeouts: StoreTimeouts) -> Result<()> {
		if self.is_closed() {
			return Err(CounterError::Closed)
		}
		if timeouts.is_empty() {
			trace!("No store timeouts to apply");
			return Ok(())
		}

		self.store.configure(&timeouts).await.map_err(store_error)
	}

	/// Closes the engine and its store. Every later call fails with [`CounterError::Closed`].
	pub async fn close(&self) -> Result<()> {
		if self.closed.swap(true, Ordering::AcqRel) {
			return Err(CounterError::Closed)
		}

		self.store.close().await.map_err(|e| {
			error!("Failed to close store: {}", e);
			store_error(e)
		})?;
		debug!("Counter engine closed");

		Ok(())
	}

	async fn run(&self, key: &str, options: IncrementOptions, mode: Mode<'_>) -> Result<Option<i64>> {
		self.check(key)?;
		let plan = self.plan(options)?;

		if self.ensure_exists(key).await? {
			return Ok(None)
		}

		let mut retry = self.config.retry.start();
		loop {
			if let Mode::RetryUntil(cancel) = mode {
				if cancel.is_cancelled() {
					return Err(CounterError::Cancelled(key.to_string()))
				}
			}

			retry.record_attempt();
			let err = match self.cycle(key, plan).await {
				Ok(value) => {
					debug!(attempts = retry.attempts(), "Incremented {} to {}", key, value);
					return Ok(Some(value))
				},
				Err(CounterError::Contention(e)) => e,
				Err(e) => {
					error!("Failed to increment {}: {}", key, e);
					return Err(e)
				},
			};

			match mode {
				Mode::Once => return Err(CounterError::Contention(err)),
				Mode::Retry => self.pause(key, &mut retry, &err).await?,
				Mode::RetryUntil(cancel) => tokio::select! {
					_ = cancel.cancelled() => return Err(CounterError::Cancelled(key.to_string())),
					res = self.pause(key, &mut retry, &err) => res?,
				},
			}
		}
	}

	async fn pause(&self, key: &str, retry: &mut RetryState, cause: &StoreError) -> Result<()> {
		trace!(attempts = retry.attempts(), "Retrying {} after {}", key, cause);

		retry.pause(key).await.map_err(|e| {
			warn!("Giving up on {} after {} attempts: {}", key, retry.attempts(), e);
			e
		})
	}

	/// One locked read-modify-write cycle.
	async fn cycle(&self, key: &str, plan: Plan) -> Result<i64> {
		let (value, token) =
			self.store.read_and_lock(key, self.config.lock_ttl).await.map_err(|e| match e {
				StoreError::NotFound(_) => CounterError::VanishedKey(key.to_string()),
				e if e.is_transient() => CounterError::Contention(e),
				e => store_error(e),
			})?;

		let current = counter_from_value(&value)
			.ok_or_else(|| CounterError::NonIntegral { key: key.to_string(), value })?;
		let next = advance(current, plan.step, self.config.initial, plan.rollover);

		self.store.replace_cas(key, next, token).await.map_err(|e| match e {
			StoreError::NotFound(_) => CounterError::VanishedKey(key.to_string()),
			e if e.is_transient() => CounterError::Contention(e),
			e => store_error(e),
		})?;
		trace!(%token, "Replaced {} -> {} on {}", current, next, key);

		Ok(next)
	}

	/// Creates `key` if it is missing. Returns whether this call created it.
	async fn ensure_exists(&self, key: &str) -> Result<bool> {
		let _guard = self.init_lock.lock().await;

		match self.store.read(key).await {
			Ok(value) => match counter_from_value(&value) {
				Some(_) => Ok(false),
				None => Err(CounterError::NonIntegral { key: key.to_string(), value }),
			},
			Err(StoreError::NotFound(_)) => {
				self.store.create_if_absent(key, self.config.initial).await.map_err(|e| {
					error!("Failed to create {}: {}", key, e);
					store_error(e)
				})?;
				debug!("Initialized {} at {}", key, self.config.initial);

				Ok(true)
			},
			Err(e) => Err(store_error(e)),
		}
	}

	fn check(&self, key: &str) -> Result<()> {
		if self.is_closed() {
			return Err(CounterError::Closed)
		}
		if key.is_empty() {
			return Err(CounterError::EmptyKey)
		}

		Ok(())
	}

	fn plan(&self, options: IncrementOptions) -> Result<Plan> {
		let rollover = match options.rollover {
			Some(rollover) => {
				validate_bounds(self.config.initial, rollover)?;
				Some(rollover)
			},
			None if self.config.use_rollover_check => Some(self.config.rollover),
			None => None,
		};

		Ok(Plan { step: options.step.unwrap_or(self.config.step).get(), rollover })
	}
}

fn store_error(e: StoreError) -> CounterError {
	match e {
		StoreError::Closed => CounterError::Closed,
		e => CounterError::Store(e),
	}
}

/// Next value of a counter holding `current`.
///
/// A candidate above `rollover` resets to `initial`. `i64::MAX` is an implicit ceiling for
/// counters without a rollover.
pub(crate) fn advance(current: i64, step: u64, initial: i64, rollover: Option<u64>) -> i64 {
	let candidate = i128::from(current) + i128::from(step);
	let ceiling =
		rollover.map_or(i128::from(i64::MAX), |r| i128::from(r).min(i128::from(i64::MAX)));

	if candidate > ceiling {
		initial
	} else {
		candidate as i64
	}
}
