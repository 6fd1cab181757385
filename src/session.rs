use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use log::{debug, info, warn};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::error::{PresenceError, Result};
use crate::event::PresenceEvent;
use crate::model::{
	Connectivity, HybridClock, HybridTimestamp, LocationRecord, OwnerId, PeerSubscription,
	PendingUpdate,
};
use crate::observability::MetricsRegistry;
use crate::store::{KeyValueStore, LocalStore};
use crate::sync::worker::SyncWorker;
use crate::sync::{
	ChangeQueue, MergeResult, ReconciliationEngine, ScheduleController, ScheduleEvent,
	SyncTransport,
};

const EVENT_CAPACITY: usize = 256;

/// Check that a sample is a usable WGS84 fix.
fn validate_sample(latitude: f64, longitude: f64, accuracy: f64) -> Result<()> {
	if !(latitude.is_finite() && longitude.is_finite() && accuracy.is_finite()) {
		return Err(PresenceError::InvalidLocation(
			"coordinates and accuracy must be finite".into(),
		));
	}
	if !(-90.0..=90.0).contains(&latitude) {
		return Err(PresenceError::InvalidLocation(format!(
			"latitude {} outside [-90, 90]",
			latitude
		)));
	}
	if !(-180.0..=180.0).contains(&longitude) {
		return Err(PresenceError::InvalidLocation(format!(
			"longitude {} outside [-180, 180]",
			longitude
		)));
	}
	if accuracy < 0.0 {
		return Err(PresenceError::InvalidLocation(format!(
			"accuracy {} is negative",
			accuracy
		)));
	}
	Ok(())
}

/// Handle returned by `PresenceSession::on_change`. Dropping it also
/// unregisters the callback.
pub struct ChangeSubscription {
	task: JoinHandle<()>,
}

impl ChangeSubscription {
	pub fn cancel(self) {}
}

impl Drop for ChangeSubscription {
	fn drop(&mut self) {
		self.task.abort();
	}
}

/// Location sharing for one signed-in identity.
///
/// Owns the local cache, the outbound queue, the background sync worker
/// and the inbound subscription. Reads never wait for the network.
pub struct PresenceSession {
	identity: OwnerId,
	worker: Arc<SyncWorker>,
	/// Serializes local reports so sequence numbers are handed out once.
	clock: Mutex<HybridClock>,
	closed: AtomicBool,
	shutdown: watch::Sender<bool>,
	task: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceSession {
	/// Restore state from `kv` and start background synchronization for
	/// `identity`. Presence tracking stays inactive until `start`.
	pub async fn open(
		identity: OwnerId,
		settings: &Settings,
		transport: Arc<dyn SyncTransport>,
		kv: Arc<dyn KeyValueStore>,
	) -> Result<Self> {
		let policy = settings.sync_policy();
		let metrics = Arc::new(MetricsRegistry::new()?);

		let store = Arc::new(LocalStore::load(Arc::clone(&kv)).await?);
		let queue = Arc::new(ChangeQueue::load(kv, policy.queue, Arc::clone(&metrics)).await?);
		let engine = Arc::new(ReconciliationEngine::new(
			identity.clone(),
			policy.tie_break,
			store,
			Arc::clone(&metrics),
		));

		let own = engine.store().get(&identity).await;
		let clock = match &own {
			Some(record) => HybridClock::seeded(record.timestamp),
			None => HybridClock::new(),
		};
		let sharing = own.as_ref().is_none_or(|r| r.sharing);

		let (events, _) = broadcast::channel(EVENT_CAPACITY);
		let controller = ScheduleController::new(policy.schedule, transport.connectivity());
		let worker = Arc::new(SyncWorker::new(
			identity.clone(),
			transport,
			engine,
			queue,
			controller,
			events,
			metrics,
			sharing,
		));

		let (shutdown, shutdown_rx) = watch::channel(false);
		let task = Arc::clone(&worker).spawn(policy.tick_interval, shutdown_rx);
		if !worker.queue.is_empty().await {
			worker.trigger();
		}
		info!(
			"Opened presence session for {} ({} pending updates)",
			identity,
			worker.queue.len().await
		);

		Ok(Self {
			identity,
			worker,
			clock: Mutex::new(clock),
			closed: AtomicBool::new(false),
			shutdown,
			task: Mutex::new(Some(task)),
		})
	}

	pub fn identity(&self) -> &OwnerId {
		&self.identity
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::SeqCst) {
			Err(PresenceError::Closed)
		} else {
			Ok(())
		}
	}

	/// Follow `peers`. Calling again with the same set while following is
	/// a no-op; a different set replaces the subscription.
	///
	/// Waits for the first subscribe attempt; a concurrent `stop` cancels
	/// it and this returns `Ok`.
	pub async fn start(&self, peers: impl IntoIterator<Item = OwnerId>) -> Result<()> {
		self.ensure_open()?;
		let wanted = PeerSubscription::new(peers);
		if self.worker.subscribed_peers().await.as_ref() == Some(&wanted) {
			return Ok(());
		}

		self.worker.set_presence_active(true).await;
		self.worker.open_subscription(wanted.peer_ids).await?;
		self.worker.trigger();
		Ok(())
	}

	/// The peers this session follows, if started.
	pub async fn subscription(&self) -> Option<PeerSubscription> {
		self.worker.subscribed_peers().await
	}

	/// Stop following peers. Once this returns no record from the closed
	/// subscription is applied. Never waits on the transport; queued
	/// outbound updates keep draining.
	pub async fn stop(&self) {
		self.worker.close_subscription().await;
		self.worker.set_presence_active(false).await;
	}

	/// Record a new sample of this identity's location and queue it for
	/// delivery. Returns `None` while sharing is withdrawn.
	pub async fn report_location(
		&self,
		latitude: f64,
		longitude: f64,
		accuracy: f64,
	) -> Result<Option<LocationRecord>> {
		self.ensure_open()?;
		validate_sample(latitude, longitude, accuracy)?;
		if !self.worker.sharing.load(Ordering::SeqCst) {
			debug!("Ignoring sample for {}: sharing is withdrawn", self.identity);
			return Ok(None);
		}

		let record = self
			.publish_own(|owner, seq, ts| {
				LocationRecord::new(owner, seq, ts, latitude, longitude, accuracy)
			})
			.await?;
		Ok(Some(record))
	}

	/// Withdraw (`false`) or resume (`true`) sharing this identity's
	/// location. Withdrawing publishes a withdrawal record; resuming takes
	/// effect with the next reported sample.
	pub async fn set_sharing(&self, sharing: bool) -> Result<Option<LocationRecord>> {
		self.ensure_open()?;
		let was = self.worker.sharing.swap(sharing, Ordering::SeqCst);
		if sharing || !was {
			return Ok(None);
		}
		info!("{} stopped sharing location", self.identity);
		let record = self.publish_own(LocationRecord::withdrawal).await?;
		Ok(Some(record))
	}

	/// Stamp a new own record, apply it locally, queue it and wake the
	/// worker.
	async fn publish_own<F>(&self, build: F) -> Result<LocationRecord>
	where
		F: Fn(OwnerId, u64, HybridTimestamp) -> LocationRecord,
	{
		let mut clock = self.clock.lock().await;
		let engine = &self.worker.engine;

		// A newer own record from another session can land between reading
		// the stored sequence and applying; stamp again on top of it.
		let record = loop {
			let stored = engine.store().get(&self.identity).await;
			let sequence = match &stored {
				Some(r) => {
					clock.observe(r.timestamp);
					r.sequence + 1
				}
				None => 1,
			};
			let timestamp = clock.now();
			let record = build(self.identity.clone(), sequence, timestamp);
			if engine.merge_local(record.clone()).await? == MergeResult::Applied {
				break record;
			}
		};
		drop(clock);

		self.worker.emit(PresenceEvent::for_applied(record.clone()));
		let outcome = self.worker.queue.enqueue(record.clone(), Utc::now()).await?;
		self.worker.report_dropped(outcome.dropped);
		self.worker.trigger();
		Ok(record)
	}

	/// Last-known locations of every owner currently sharing, including
	/// this identity.
	pub async fn current_locations(&self) -> HashMap<OwnerId, LocationRecord> {
		self.worker
			.engine
			.store()
			.snapshot()
			.await
			.into_iter()
			.filter(|(_, record)| record.sharing)
			.collect()
	}

	/// Last-known location of `owner`, if it is sharing.
	pub async fn location_of(&self, owner: &OwnerId) -> Option<LocationRecord> {
		self.worker
			.engine
			.store()
			.get(owner)
			.await
			.filter(|record| record.sharing)
	}

	/// Raw notification stream. Slow receivers observe
	/// `RecvError::Lagged` and skip ahead.
	pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
		self.worker.events.subscribe()
	}

	/// Call `callback` for every notification until the returned handle is
	/// cancelled or dropped.
	pub fn on_change<F>(&self, callback: F) -> ChangeSubscription
	where
		F: Fn(&PresenceEvent) + Send + Sync + 'static,
	{
		let mut events = self.events();
		let task = tokio::spawn(async move {
			loop {
				match events.recv().await {
					Ok(event) => callback(&event),
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!("Change listener lagged, skipped {} events", skipped);
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
		ChangeSubscription { task }
	}

	/// Entry point for an OS background scheduler. Returns whether a sync
	/// run happened; late or batched calls are fine.
	pub async fn background_sync(&self) -> Result<bool> {
		self.ensure_open()?;
		Ok(self.worker.step(ScheduleEvent::Tick).await)
	}

	/// Resume pushes and the subscription after the identity was
	/// re-authenticated.
	pub async fn resume_after_reauth(&self) -> Result<()> {
		self.ensure_open()?;
		if self.worker.clear_auth_block() {
			info!("Resuming sync for {} after re-authentication", self.identity);
		}
		self.worker.ensure_subscription().await;
		self.worker.trigger();
		Ok(())
	}

	pub fn connectivity(&self) -> Connectivity {
		self.worker.transport.connectivity()
	}

	/// Outbound updates not yet acknowledged.
	pub async fn pending_updates(&self) -> Vec<PendingUpdate> {
		self.worker.queue.pending().await
	}

	pub fn metrics(&self) -> Arc<MetricsRegistry> {
		Arc::clone(&self.worker.metrics)
	}

	/// Stop the worker and the subscription. Queued updates stay persisted
	/// for the next session.
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.stop().await;
		let _ = self.shutdown.send(true);
		if let Some(task) = self.task.lock().await.take() {
			if let Err(e) = task.await {
				warn!("Sync worker for {} ended abnormally: {}", self.identity, e);
			}
		}
		info!("Closed presence session for {}", self.identity);
	}
}

impl Drop for PresenceSession {
	fn drop(&mut self) {
		// The worker closes the subscription on its way out.
		let _ = self.shutdown.send(true);
	}
}
