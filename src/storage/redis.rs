use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, AsyncCommands, Client, Script};
use serde_json::Value;
use std::{sync::Mutex, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

use crate::{
	config::StoreTimeouts,
	types::{CasToken, StoreError},
};

use super::{common::with_timeout, KeyedStore};

/// Hash field holding the JSON encoded counter value.
const VALUE_FIELD: &str = "value";

const CREATE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 1 then return 0 end
redis.call('HSET', KEYS[1], 'value', ARGV[1], 'cas', 1)
return 1
";

const LOCK_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'not_found', '', 0} end
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local locked_until = tonumber(redis.call('HGET', KEYS[1], 'lock_until') or '0')
if locked_until > now then return {'locked', '', 0} end
local cas = redis.call('HINCRBY', KEYS[1], 'cas', 1)
redis.call('HSET', KEYS[1], 'lock_until', now + tonumber(ARGV[1]))
return {'ok', redis.call('HGET', KEYS[1], 'value'), cas}
";

const REPLACE_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {'not_found', '', 0} end
local cas = tonumber(redis.call('HGET', KEYS[1], 'cas'))
if cas ~= tonumber(ARGV[2]) then return {'cas_mismatch', '', cas} end
redis.call('HSET', KEYS[1], 'value', ARGV[1])
cas = redis.call('HINCRBY', KEYS[1], 'cas', 1)
redis.call('HDEL', KEYS[1], 'lock_until')
return {'ok', ARGV[1], cas}
";

/// Redis implementation of [`KeyedStore`].
///
/// Every counter is a hash with the `value`, its `cas` and, while locked, the `lock_until`
/// deadline in server time. Lock and replace run as Lua scripts so that each primitive is atomic
/// on the server.
pub struct RedisStore {
	con: RwLock<Option<MultiplexedConnection>>,
	timeouts: Mutex<StoreTimeouts>,
	create: Script,
	lock: Script,
	replace: Script,
}

impl RedisStore {
	/// Connects to `url`, e.g. `redis://:password@localhost:6379/`.
	pub async fn connect(url: &str) -> Result<Self, StoreError> {
		let client = Client::open(url)?;
		let con = client.get_multiplexed_tokio_connection().await.map_err(|e| {
			error!("Failed to connect to Redis: {}", e);
			StoreError::Redis(e)
		})?;
		debug!("Connected to Redis");

		Ok(Self {
			con: RwLock::new(Some(con)),
			timeouts: Mutex::new(StoreTimeouts::default()),
			create: Script::new(CREATE_SCRIPT),
			lock: Script::new(LOCK_SCRIPT),
			replace: Script::new(REPLACE_SCRIPT),
		})
	}

	/// Connects using `REDIS_URL`, or `REDIS_PROTOCOL`, `REDIS_HOST`, `REDIS_PORT` and
	/// `REDIS_PASSWORD` when it is not set.
	pub async fn from_env() -> Result<Self, StoreError> {
		let url = match std::env::var("REDIS_URL") {
			Ok(url) => url,
			Err(_) => {
				let protocol = std::env::var("REDIS_PROTOCOL").unwrap_or_else(|_| "redis".into());
				let host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".into());
				let port = std::env::var("REDIS_PORT").unwrap_or_else(|_| "6379".into());
				let password = std::env::var("REDIS_PASSWORD").unwrap_or_default();
				format!("{}://:{}@{}:{}/", protocol, password, host, port)
			},
		};

		Self::connect(&url).await
	}

	async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
		self.con.read().await.clone().ok_or(StoreError::Closed)
	}

	fn operation_timeout(&self) -> Option<Duration> {
		self.timeouts.lock().map_or(None, |timeouts| timeouts.operation)
	}
}

/// Decodes the `{status, value, cas}` reply of the lock and replace scripts.
fn script_reply(
	key: &str,
	(status, value, cas): (String, String, u64),
) -> Result<(Value, CasToken), StoreError> {
	match status.as_str() {
		"ok" => {
			let value = serde_json::from_str(&value).map_err(|e| {
				error!("Failed to parse counter value of {}: {}", key, e);
				StoreError::Parsing(e.to_string())
			})?;
			Ok((value, CasToken(cas)))
		},
		"not_found" => Err(StoreError::NotFound(key.to_string())),
		"locked" => Err(StoreError::Locked(key.to_string())),
		"cas_mismatch" => Err(StoreError::CasMismatch(key.to_string())),
		other => Err(StoreError::Backend(format!("unexpected script status {}", other))),
	}
}

#[async_trait]
impl KeyedStore for RedisStore {
	#[instrument(skip(self))]
	async fn read(&self, key: &str) -> Result<Value, StoreError> {
		let mut con = self.connection().await?;
		let raw: Option<String> =
			with_timeout(self.operation_timeout(), async { Ok(con.hget(key, VALUE_FIELD).await?) })
				.await?;

		let raw = raw.ok_or_else(|| StoreError::NotFound(key.to_string()))?;
		serde_json::from_str(&raw).map_err(|e| StoreError::Parsing(e.to_string()))
	}

	#[instrument(skip(self))]
	async fn create_if_absent(&self, key: &str, seed: i64) -> Result<(), StoreError> {
		let mut con = self.connection().await?;
		let created: i64 = with_timeout(self.operation_timeout(), async {
			Ok(self.create.key(key).arg(seed.to_string()).invoke_async(&mut con).await?)
		})
		.await?;

		if created == 1 {
			debug!("Created key {} with seed {}", key, seed);
		}
		Ok(())
	}

	#[instrument(skip(self))]
	async fn read_and_lock(
		&self,
		key: &str,
		ttl: Duration,
	) -> Result<(Value, CasToken), StoreError> {
		let mut con = self.connection().await?;
		let reply: (String, String, u64) = with_timeout(self.operation_timeout(), async {
			Ok(self.lock.key(key).arg(ttl.as_millis() as u64).invoke_async(&mut con).await?)
		})
		.await?;

		script_reply(key, reply)
	}

	#[instrument(skip(self))]
	async fn replace_cas(&self, key: &str, value: i64, token: CasToken) -> Result<(), StoreError> {
		let mut con = self.connection().await?;
		let reply: (String, String, u64) = with_timeout(self.operation_timeout(), async {
			Ok(self
				.replace
				.key(key)
				.arg(value.to_string())
				.arg(token.0)
				.invoke_async(&mut con)
				.await?)
		})
		.await?;

		script_reply(key, reply).map(|_| ())
	}

	async fn configure(&self, timeouts: &StoreTimeouts) -> Result<(), StoreError> {
		let mut current =
			self.timeouts.lock().map_err(|e| StoreError::Backend(e.to_string()))?;
		current.merge(timeouts);
		debug!("Applied store timeouts {:?}", *current);

		Ok(())
	}

	async fn close(&self) -> Result<(), StoreError> {
		match self.con.write().await.take() {
			Some(_) => {
				debug!("Closed Redis connection");
				Ok(())
			},
			None => Err(StoreError::Closed),
		}
	}
}
