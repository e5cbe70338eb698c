use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
#[error("store operation failed: {0}")]
pub struct StoreError(pub String);

/// Namespace for every key the agent writes. External store handlers may
/// prepend their own configured prefix on top.
pub const KEY_PREFIX: &str = "agent:";

/// Latest agent status snapshot, refreshed by the heartbeat task.
pub const STATUS_KEY: &str = "agent:status:last";

/// Last dynamic rule document seen; read back on start.
pub const RULES_KEY: &str = "agent:rules:cache";

/// Spilled buffer items survive a week before the store may reap them.
pub const OVERFLOW_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub const STATUS_TTL: Duration = Duration::from_secs(60 * 60);

/// Which buffer queue an overflow entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
	Events,
	Metrics,
}

impl QueueKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			QueueKind::Events => "events",
			QueueKind::Metrics => "metrics",
		}
	}
}

pub fn overflow_prefix(kind: QueueKind) -> String {
	format!("{}overflow:{}:", KEY_PREFIX, kind.as_str())
}

pub fn overflow_key(kind: QueueKind, sequence: u64) -> String {
	format!("{}{}", overflow_prefix(kind), sequence)
}

/// Parse the numeric sequence suffix out of an overflow key.
pub fn sequence_of(key: &str) -> Option<u64> {
	key.rsplit(':').next()?.parse().ok()
}

/// Capability the buffer expects from any durable key/value store. Values
/// are JSON strings; absence of a store is a supported mode in which the
/// buffer runs purely in memory.
#[async_trait]
pub trait OverflowStore: Send + Sync {
	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;
	async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
	async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
	async fn get_size(&self, key: &str) -> Result<usize, StoreError>;
}

struct Entry {
	value: String,
	expires_at: Option<Instant>,
}

impl Entry {
	fn expired(&self) -> bool {
		self.expires_at.is_some_and(|at| Instant::now() >= at)
	}
}

/// In-process store implementation. Backs tests and hosts that want
/// within-process overflow without an external key/value service; it does
/// not survive a restart.
#[derive(Default)]
pub struct MemoryStore {
	entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl OverflowStore for MemoryStore {
	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
		let mut entries = self.entries.lock().await;
		entries.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: ttl.map(|d| Instant::now() + d),
			},
		);
		Ok(())
	}

	async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
		let mut entries = self.entries.lock().await;
		match entries.get(key) {
			Some(e) if e.expired() => {
				entries.remove(key);
				Ok(None)
			}
			Some(e) => Ok(Some(e.value.clone())),
			None => Ok(None),
		}
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.entries.lock().await.remove(key);
		Ok(())
	}

	async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		let entries = self.entries.lock().await;
		Ok(entries
			.iter()
			.filter(|(k, e)| k.starts_with(prefix) && !e.expired())
			.map(|(k, _)| k.clone())
			.collect())
	}

	async fn get_size(&self, key: &str) -> Result<usize, StoreError> {
		let entries = self.entries.lock().await;
		Ok(entries
			.get(key)
			.filter(|e| !e.expired())
			.map(|e| e.value.len())
			.unwrap_or(0))
	}
}
