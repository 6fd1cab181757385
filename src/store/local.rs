use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{RwLock, RwLockWriteGuard};

use super::{KeyValueStore, StoreError, load_json, save_json};
use crate::model::{LocationRecord, OwnerId};

const KEY_PREFIX: &str = "location/";

fn record_key(owner: &OwnerId) -> String {
	format!("{}{}", KEY_PREFIX, owner)
}

/// One owner's retained record. Replaced as a whole under its own lock so
/// readers never observe a partial write and unrelated owners never wait
/// on each other.
#[derive(Debug, Default)]
pub(crate) struct OwnerSlot {
	record: RwLock<Option<LocationRecord>>,
}

impl OwnerSlot {
	pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, Option<LocationRecord>> {
		self.record.write().await
	}

	async fn read(&self) -> Option<LocationRecord> {
		self.record.read().await.clone()
	}
}

/// Durable cache of the last-known record per owner (own and peers').
///
/// Reads are open to everyone; writes go through `ReconciliationEngine`,
/// which holds an owner's slot lock while it compares, persists and
/// replaces that owner's record.
pub struct LocalStore {
	kv: Arc<dyn KeyValueStore>,
	slots: RwLock<HashMap<OwnerId, Arc<OwnerSlot>>>,
}

impl LocalStore {
	/// Restore all persisted records from `kv`. Entries that fail to decode
	/// are skipped with a warning rather than failing the whole load.
	pub async fn load(kv: Arc<dyn KeyValueStore>) -> Result<Self, StoreError> {
		let mut slots = HashMap::new();
		for key in kv.keys_with_prefix(KEY_PREFIX).await? {
			match load_json::<LocationRecord>(kv.as_ref(), &key).await {
				Ok(Some(record)) => {
					let slot = OwnerSlot {
						record: RwLock::new(Some(record.clone())),
					};
					slots.insert(record.owner, Arc::new(slot));
				}
				Ok(None) => {}
				Err(StoreError::Serde(e)) => {
					warn!("Skipping undecodable location entry {}: {}", key, e);
				}
				Err(e) => return Err(e),
			}
		}
		debug!("Restored {} location records", slots.len());

		Ok(Self {
			kv,
			slots: RwLock::new(slots),
		})
	}

	/// Last-known record for `owner`, including withdrawals.
	pub async fn get(&self, owner: &OwnerId) -> Option<LocationRecord> {
		let slot = self.slots.read().await.get(owner).cloned();
		match slot {
			Some(slot) => slot.read().await,
			None => None,
		}
	}

	/// Per-owner consistent copy of every retained record.
	pub async fn snapshot(&self) -> HashMap<OwnerId, LocationRecord> {
		let slots: Vec<Arc<OwnerSlot>> = self.slots.read().await.values().cloned().collect();
		let mut out = HashMap::with_capacity(slots.len());
		for slot in slots {
			if let Some(record) = slot.read().await {
				out.insert(record.owner.clone(), record);
			}
		}
		out
	}

	pub async fn len(&self) -> usize {
		self.slots.read().await.len()
	}

	/// The slot for `owner`, created empty on first use.
	pub(crate) async fn slot(&self, owner: &OwnerId) -> Arc<OwnerSlot> {
		if let Some(slot) = self.slots.read().await.get(owner) {
			return Arc::clone(slot);
		}
		let mut slots = self.slots.write().await;
		Arc::clone(slots.entry(owner.clone()).or_default())
	}

	/// Write `record` through to durable storage. Callers hold the owner's
	/// slot lock.
	pub(crate) async fn persist(&self, record: &LocationRecord) -> Result<(), StoreError> {
		save_json(self.kv.as_ref(), &record_key(&record.owner), record).await
	}
}
