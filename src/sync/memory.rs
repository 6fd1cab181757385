use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::transport::{RecordStream, SyncTransport, TransportError};
use crate::model::{Connectivity, LocationRecord, OwnerId};

struct Subscriber {
	peers: BTreeSet<OwnerId>,
	tx: mpsc::UnboundedSender<LocationRecord>,
}

struct HubInner {
	records: Mutex<HashMap<OwnerId, LocationRecord>>,
	subscribers: Mutex<Vec<Subscriber>>,
	scripted_failures: Mutex<VecDeque<TransportError>>,
	revoked: Mutex<HashSet<OwnerId>>,
	connectivity: watch::Sender<Connectivity>,
	duplicate_delivery: AtomicBool,
	pushes: AtomicU64,
}

impl HubInner {
	async fn store_and_fan_out(&self, record: LocationRecord) {
		{
			let mut records = self.records.lock().await;
			let newer = records
				.get(&record.owner)
				.is_none_or(|existing| record.version() > existing.version());
			if newer {
				records.insert(record.owner.clone(), record.clone());
			}
		}

		let copies = if self.duplicate_delivery.load(Ordering::Relaxed) {
			2
		} else {
			1
		};
		let mut subscribers = self.subscribers.lock().await;
		subscribers.retain(|s| {
			if !s.peers.contains(&record.owner) {
				return !s.tx.is_closed();
			}
			(0..copies).all(|_| s.tx.send(record.clone()).is_ok())
		});
	}
}

/// In-process realtime store shared by any number of `MemoryTransport`
/// handles, one per identity.
///
/// Keeps the latest record per owner, replays it to new subscribers and
/// drops all subscriptions when connectivity leaves `Online`. Push
/// failures, duplicate delivery and revoked identities can be scripted.
#[derive(Clone)]
pub struct MemoryHub {
	inner: Arc<HubInner>,
}

impl Default for MemoryHub {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryHub {
	pub fn new() -> Self {
		let (connectivity, _) = watch::channel(Connectivity::Online);
		Self {
			inner: Arc::new(HubInner {
				records: Mutex::new(HashMap::new()),
				subscribers: Mutex::new(Vec::new()),
				scripted_failures: Mutex::new(VecDeque::new()),
				revoked: Mutex::new(HashSet::new()),
				connectivity,
				duplicate_delivery: AtomicBool::new(false),
				pushes: AtomicU64::new(0),
			}),
		}
	}

	/// A transport authenticated as `identity`.
	pub fn transport(&self, identity: OwnerId) -> MemoryTransport {
		MemoryTransport {
			identity,
			hub: Arc::clone(&self.inner),
		}
	}

	/// Change connectivity for every transport. Leaving `Online` ends all
	/// open subscriptions.
	pub async fn set_connectivity(&self, state: Connectivity) {
		let previous = self.inner.connectivity.send_replace(state);
		if previous != state {
			debug!("Hub connectivity {} -> {}", previous, state);
		}
		if !state.is_online() {
			self.inner.subscribers.lock().await.clear();
		}
	}

	/// Fail the next pushes (from any identity) with `error`, in order.
	pub async fn fail_next_pushes(&self, count: usize, error: TransportError) {
		let mut failures = self.inner.scripted_failures.lock().await;
		failures.extend(std::iter::repeat_n(error, count));
	}

	/// Deliver every record twice to each subscriber.
	pub fn set_duplicate_delivery(&self, enabled: bool) {
		self.inner
			.duplicate_delivery
			.store(enabled, Ordering::Relaxed);
	}

	/// Reject every further operation by `identity`.
	pub async fn revoke(&self, identity: &OwnerId) {
		self.inner.revoked.lock().await.insert(identity.clone());
	}

	pub async fn reinstate(&self, identity: &OwnerId) {
		self.inner.revoked.lock().await.remove(identity);
	}

	/// Write a record as some other client would, bypassing scripted
	/// failures. Delivered in whatever order callers publish.
	pub async fn publish(&self, record: LocationRecord) {
		self.inner.store_and_fan_out(record).await;
	}

	/// Latest record the remote store holds for `owner`.
	pub async fn record(&self, owner: &OwnerId) -> Option<LocationRecord> {
		self.inner.records.lock().await.get(owner).cloned()
	}

	/// Successful pushes so far.
	pub fn push_count(&self) -> u64 {
		self.inner.pushes.load(Ordering::Relaxed)
	}

	pub async fn subscriber_count(&self) -> usize {
		let mut subscribers = self.inner.subscribers.lock().await;
		subscribers.retain(|s| !s.tx.is_closed());
		subscribers.len()
	}
}

/// One identity's view of a `MemoryHub`.
#[derive(Clone)]
pub struct MemoryTransport {
	identity: OwnerId,
	hub: Arc<HubInner>,
}

impl MemoryTransport {
	async fn check_access(&self) -> Result<(), TransportError> {
		if self.hub.revoked.lock().await.contains(&self.identity) {
			return Err(TransportError::PermanentRejection(format!(
				"identity {} has been revoked",
				self.identity
			)));
		}
		if !self.connectivity().is_online() {
			return Err(TransportError::Offline);
		}
		Ok(())
	}
}

#[async_trait]
impl SyncTransport for MemoryTransport {
	async fn push(&self, record: &LocationRecord) -> Result<(), TransportError> {
		self.check_access().await?;
		if record.owner != self.identity {
			return Err(TransportError::PermanentRejection(format!(
				"{} may not write the location of {}",
				self.identity, record.owner
			)));
		}
		if let Some(err) = self.hub.scripted_failures.lock().await.pop_front() {
			return Err(err);
		}

		self.hub.store_and_fan_out(record.clone()).await;
		self.hub.pushes.fetch_add(1, Ordering::Relaxed);
		Ok(())
	}

	async fn subscribe(&self, peers: &BTreeSet<OwnerId>) -> Result<RecordStream, TransportError> {
		self.check_access().await?;

		let (tx, rx) = mpsc::unbounded_channel();
		{
			let records = self.hub.records.lock().await;
			for peer in peers {
				if let Some(record) = records.get(peer) {
					let _ = tx.send(record.clone());
				}
			}
		}
		self.hub.subscribers.lock().await.push(Subscriber {
			peers: peers.clone(),
			tx,
		});
		debug!("{} subscribed to {} peers", self.identity, peers.len());

		Ok(Box::pin(UnboundedReceiverStream::new(rx)))
	}

	fn connectivity(&self) -> Connectivity {
		*self.hub.connectivity.borrow()
	}

	fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
		self.hub.connectivity.subscribe()
	}
}
