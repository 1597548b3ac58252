use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rollover_counter::{
	CasToken, Counter, CounterConfig, IncrementOptions, KeyedStore, MemoryStore, Result,
	RetryPolicy, StoreError,
};
use serde_json::Value;

// A store that logs every primitive before handing it to an in-memory store.
struct TracingStore(MemoryStore);

#[async_trait]
impl KeyedStore for TracingStore {
	async fn read(&self, key: &str) -> std::result::Result<Value, StoreError> {
		println!("read {}", key);
		self.0.read(key).await
	}

	async fn create_if_absent(&self, key: &str, seed: i64) -> std::result::Result<(), StoreError> {
		println!("create {} = {}", key, seed);
		self.0.create_if_absent(key, seed).await
	}

	async fn read_and_lock(
		&self,
		key: &str,
		ttl: Duration,
	) -> std::result::Result<(Value, CasToken), StoreError> {
		let (value, token) = self.0.read_and_lock(key, ttl).await?;
		println!("locked {} = {} with {}", key, value, token);
		Ok((value, token))
	}

	async fn replace_cas(
		&self,
		key: &str,
		value: i64,
		token: CasToken,
	) -> std::result::Result<(), StoreError> {
		println!("replace {} = {} with {}", key, value, token);
		self.0.replace_cas(key, value, token).await
	}

	async fn close(&self) -> std::result::Result<(), StoreError> {
		self.0.close().await
	}
}

#[tokio::main]
async fn main() -> Result<()> {
	let config = CounterConfig::new(1, 5).with_retry(RetryPolicy::attempts(100));
	let counter = Arc::new(Counter::new(TracingStore(MemoryStore::new()), config)?);

	// The first call only creates the key.
	assert_eq!(counter.increment("ticket").await?, None);

	for _ in 0..6 {
		let value = counter.increment("ticket").await?;
		println!("ticket -> {:?}", value);
	}

	let opts = IncrementOptions::with_rollover(2);
	println!("ticket with rollover 2 -> {:?}", counter.increment_with("ticket", opts).await?);

	let handles = (0..4)
		.map(|_| {
			let counter = counter.clone();
			tokio::spawn(async move { counter.increment("ticket").await })
		})
		.collect::<Vec<_>>();
	for handle in handles {
		if let Ok(value) = handle.await {
			println!("concurrent -> {:?}", value?);
		}
	}

	println!("final ticket = {}", counter.fetch_current("ticket").await?);
	counter.close().await
}
