pub mod file;
pub mod local;

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::RwLock;

pub use file::FileStore;
pub use local::LocalStore;

/// Errors raised by durable persistence.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("I/O error at {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("serialization error: {0}")]
	Serde(#[from] serde_json::Error),

	#[error("invalid key: {0:?}")]
	InvalidKey(String),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
	StoreError::Io {
		path: path.into(),
		source,
	}
}

/// Durable on-device key-value store backing `LocalStore` and
/// `ChangeQueue`. Implemented by `MemoryStore`, `FileStore` and any
/// platform store the host application provides.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
	/// Replace the value at `key`. Implementations must make the write
	/// atomic: a reader sees either the old or the new value.
	async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
	/// All keys starting with `prefix`, in ascending order.
	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
}

/// Read and decode a JSON value.
pub async fn load_json<T: DeserializeOwned>(
	kv: &dyn KeyValueStore,
	key: &str,
) -> Result<Option<T>, StoreError> {
	match kv.get(key).await? {
		Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
		None => Ok(None),
	}
}

/// Encode and write a JSON value.
pub async fn save_json<T: Serialize + ?Sized>(
	kv: &dyn KeyValueStore,
	key: &str,
	value: &T,
) -> Result<(), StoreError> {
	let bytes = serde_json::to_vec(value)?;
	kv.put(key, &bytes).await
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
	entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}
}

#[async_trait]
impl KeyValueStore for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
		Ok(self.entries.read().await.get(key).cloned())
	}

	async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
		self.entries
			.write()
			.await
			.insert(key.to_string(), value.to_vec());
		Ok(())
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.entries.write().await.remove(key);
		Ok(())
	}

	async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
		let entries = self.entries.read().await;
		Ok(entries
			.range(prefix.to_string()..)
			.take_while(|(k, _)| k.starts_with(prefix))
			.map(|(k, _)| k.clone())
			.collect())
	}
}
