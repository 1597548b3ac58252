use std::{error::Error, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use rollover_counter::{
	Counter, CounterConfig, IncrementOptions, KeyedStore, MemoryStore, Step, StoreTimeouts,
};
use tracing::{info, warn, Level};
use tracing_subscriber::fmt;

#[derive(Parser, Debug)]
struct Args {
	/// Backing store: `memory`, `rocksdb` or `redis`.
	#[arg(long, default_value = "memory")]
	backend: String,
	/// Value a new counter starts at and wraps back to.
	#[arg(long, default_value_t = 1)]
	initial: i64,
	/// Largest value before the counter wraps.
	#[arg(long, default_value_t = 999)]
	rollover: u64,
	/// Amount added per increment.
	#[arg(long, default_value_t = 1)]
	step: u64,
	/// How long an increment holds the lock on the key.
	#[arg(long, default_value_t = 1000)]
	lock_ttl_ms: u64,
	/// Timeout of a single store operation.
	#[arg(long)]
	operation_timeout_ms: Option<u64>,
	/// Log level
	#[arg(long, default_value = "info")]
	log_level: Level,
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Increments a key once.
	Increment {
		key: String,
		/// Rollover for this call only.
		#[arg(long)]
		rollover: Option<u64>,
	},
	/// Prints the current value of a key.
	Get { key: String },
	/// Increments a key and prints its value, creating it if needed.
	Next { key: String },
	/// Runs many concurrent increments against one key.
	Hammer {
		key: String,
		/// Increments per task.
		#[arg(long, default_value_t = 100)]
		count: u32,
		/// Concurrent tasks, one per CPU by default.
		#[arg(long)]
		tasks: Option<usize>,
	},
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
	let args = Args::parse();

	let subscriber = fmt::Subscriber::builder().with_max_level(args.log_level).finish();
	tracing::subscriber::set_global_default(subscriber)?;

	info!(task = "tracing_setup", result = "success", "tracing successfully set up",);

	dotenv::dotenv().ok();

	info!(task = "dotenv_setup", result = "success", "dotenv loaded successfully");

	let step = Step::new(args.step).ok_or("step must be at least 1")?;
	let config = CounterConfig::new(args.initial, args.rollover)
		.with_step(step)
		.with_lock_ttl(Duration::from_millis(args.lock_ttl_ms));
	let timeouts = StoreTimeouts {
		operation: args.operation_timeout_ms.map(Duration::from_millis),
		..Default::default()
	};

	match args.backend.as_str() {
		"memory" => run(MemoryStore::new(), config, timeouts, args.command).await,
		#[cfg(feature = "rocksdb")]
		"rocksdb" => {
			let store = rollover_counter::storage::rocksdb::RocksDbStore::new_default()?;
			run(store, config, timeouts, args.command).await
		},
		#[cfg(feature = "redis")]
		"redis" => {
			let store = rollover_counter::storage::redis::RedisStore::from_env().await?;
			run(store, config, timeouts, args.command).await
		},
		other => Err(format!("Unsupported backend {}", other).into()),
	}
}

async fn run<S: KeyedStore + 'static>(
	store: S,
	config: CounterConfig,
	timeouts: StoreTimeouts,
	command: Command,
) -> Result<(), Box<dyn Error>> {
	let counter = Arc::new(Counter::new(store, config)?);
	counter.configure(timeouts).await?;

	match command {
		Command::Increment { key, rollover } => {
			let options = IncrementOptions { rollover, ..Default::default() };
			match counter.increment_with(&key, options).await? {
				Some(value) => println!("{}", value),
				None => println!("created {} at {}", key, counter.config().initial),
			}
		},
		Command::Get { key } => println!("{}", counter.fetch_current(&key).await?),
		Command::Next { key } =>
			println!("{}", counter.next_value(&key, IncrementOptions::default()).await?),
		Command::Hammer { key, count, tasks } => {
			let tasks = tasks.unwrap_or_else(num_cpus::get);
			info!("Running {} tasks with {} increments each against {}", tasks, count, key);

			let handles = (0..tasks)
				.map(|_| {
					let counter = counter.clone();
					let key = key.clone();
					tokio::spawn(async move {
						let mut applied = 0u32;
						for _ in 0..count {
							match counter.increment(&key).await {
								Ok(Some(_)) => applied += 1,
								Ok(None) => {},
								Err(e) => warn!("Increment failed: {}", e),
							}
						}
						applied
					})
				})
				.collect::<Vec<_>>();

			let mut applied = 0u64;
			for handle in handles {
				applied += u64::from(handle.await?);
			}
			let current = counter.fetch_current(&key).await?;
			println!("{} increments applied, {} = {}", applied, key, current);
		},
	}

	counter.close().await?;
	Ok(())
}
