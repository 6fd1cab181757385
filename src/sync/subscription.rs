use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::merge::MergeResult;
use super::transport::TransportError;
use super::worker::SyncWorker;
use crate::event::PresenceEvent;
use crate::model::{LocationRecord, OwnerId, PeerSubscription};

/// A running inbound subscription.
///
/// The consumer holds a read lock on `gate` while it merges a record;
/// closing takes the write lock, so once `close` returns no further record
/// from this subscription reaches the store.
pub(crate) struct ActiveSubscription {
	peers: PeerSubscription,
	gate: Arc<RwLock<bool>>,
	task: JoinHandle<()>,
}

impl ActiveSubscription {
	async fn close(self) {
		*self.gate.write().await = false;
		self.task.abort();
	}
}

impl SyncWorker {
	/// Follow `peers`, replacing any current subscription. This identity's
	/// own records are always followed as well, so writes from another
	/// session of the same identity are picked up.
	///
	/// The consumer task performs the first subscribe; this waits for its
	/// outcome without holding the subscription lock, so `stop` can cancel
	/// a subscribe that never completes. Only a permanent rejection is
	/// returned; transient failures are retried in the background.
	pub(crate) async fn open_subscription(
		self: &Arc<Self>,
		peers: BTreeSet<OwnerId>,
	) -> Result<(), TransportError> {
		let (ready_tx, ready_rx) = oneshot::channel();
		let gate = {
			let mut current = self.subscription.lock().await;
			if let Some(old) = current.take() {
				old.close().await;
			}
			info!("{} following {} peers", self.identity, peers.len());
			let active = self.spawn_consumer(PeerSubscription::new(peers), Some(ready_tx));
			let gate = Arc::clone(&active.gate);
			*current = Some(active);
			gate
		};

		match ready_rx.await {
			Ok(Err(e)) => {
				let mut current = self.subscription.lock().await;
				if current.as_ref().is_some_and(|a| Arc::ptr_eq(&a.gate, &gate)) {
					*current = None;
				}
				Err(e)
			}
			// `Err(_)`: cancelled by `stop` or a newer `start` first.
			Ok(Ok(())) | Err(_) => Ok(()),
		}
	}

	/// Cancel the current subscription. Returns false if none was open.
	pub(crate) async fn close_subscription(&self) -> bool {
		let Some(active) = self.subscription.lock().await.take() else {
			return false;
		};
		active.close().await;
		debug!("{} stopped following peers", self.identity);
		true
	}

	/// The peers currently followed, if a subscription is open. `active`
	/// is false while the consumer is paused after a rejection.
	pub(crate) async fn subscribed_peers(&self) -> Option<PeerSubscription> {
		self.subscription.lock().await.as_ref().map(|active| PeerSubscription {
			peer_ids: active.peers.peer_ids.clone(),
			active: !active.task.is_finished(),
		})
	}

	/// Restart the consumer if it ended on its own (e.g. after a rejection
	/// that has since been cleared). A cancelled subscription stays
	/// cancelled. Returns whether a consumer was restarted.
	pub(crate) async fn ensure_subscription(self: &Arc<Self>) -> bool {
		if self.is_auth_blocked() {
			return false;
		}
		let mut current = self.subscription.lock().await;
		let Some(active) = current.as_ref() else {
			return false;
		};
		if !active.task.is_finished() {
			return false;
		}

		let peers = active.peers.clone();
		*current = Some(self.spawn_consumer(peers, None));
		true
	}

	fn spawn_consumer(
		self: &Arc<Self>,
		peers: PeerSubscription,
		ready: Option<oneshot::Sender<Result<(), TransportError>>>,
	) -> ActiveSubscription {
		let mut followed = peers.peer_ids.clone();
		followed.insert(self.identity.clone());

		let gate = Arc::new(RwLock::new(true));
		let task = tokio::spawn(Arc::clone(self).consume(followed, Arc::clone(&gate), ready));
		ActiveSubscription { peers, gate, task }
	}

	/// Subscribe, apply deliveries and resubscribe whenever the stream
	/// ends. `ready` receives the outcome of the first attempt.
	async fn consume(
		self: Arc<Self>,
		followed: BTreeSet<OwnerId>,
		gate: Arc<RwLock<bool>>,
		mut ready: Option<oneshot::Sender<Result<(), TransportError>>>,
	) {
		let mut connectivity = self.transport.watch_connectivity();
		let mut failures = 0u32;

		loop {
			let online = connectivity.borrow_and_update().is_online();
			if !online {
				if let Some(tx) = ready.take() {
					let _ = tx.send(Ok(()));
				}
				if connectivity.changed().await.is_err() {
					return;
				}
				continue;
			}

			let subscribed = self.transport.subscribe(&followed).await;
			let first = ready.take();
			let mut records = match subscribed {
				Ok(records) => {
					match first {
						Some(tx) => {
							let _ = tx.send(Ok(()));
						}
						None => {
							self.metrics.subscription_restarts_total.inc();
							info!("{} resubscribed to {} owners", self.identity, followed.len());
						}
					}
					records
				}
				Err(TransportError::PermanentRejection(reason)) => {
					self.block_auth(reason.clone());
					if let Some(tx) = first {
						let _ = tx.send(Err(TransportError::PermanentRejection(reason)));
					}
					return;
				}
				Err(e) => {
					if let Some(tx) = first {
						let _ = tx.send(Ok(()));
					}
					failures += 1;
					let delay = self.resubscribe_backoff.delay(failures);
					warn!("Subscribe failed ({}), retrying in {:?}", e, delay);
					sleep(delay).await;
					continue;
				}
			};

			let mut received = false;
			while let Some(record) = records.next().await {
				let open = gate.read().await;
				if !*open {
					return;
				}
				self.deliver(record).await;
				received = true;
			}
			debug!("Subscription stream for {} ended", self.identity);

			// A stream that keeps ending while online must not spin.
			if received {
				failures = 0;
			}
			if self.transport.connectivity().is_online() {
				failures += 1;
				sleep(self.resubscribe_backoff.delay(failures)).await;
			}
		}
	}

	async fn deliver(&self, record: LocationRecord) {
		match self.engine.merge(record.clone()).await {
			Ok(MergeResult::Applied) => {
				if record.owner == self.identity {
					self.sharing.store(record.sharing, Ordering::SeqCst);
					if let Err(e) = self
						.queue
						.discard_through(&record.owner, record.sequence)
						.await
					{
						error!("Failed to discard superseded own updates: {}", e);
					}
				}
				self.emit(PresenceEvent::for_applied(record));
			}
			Ok(_) => {}
			Err(e) => error!("Failed to store record from {}: {}", record.owner, e),
		}
	}
}
