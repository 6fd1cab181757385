use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};

use super::backoff::BackoffPolicy;
use super::merge::ReconciliationEngine;
use super::queue::{ChangeQueue, DroppedUpdate, FailOutcome};
use super::schedule::{Decision, ScheduleController, ScheduleEvent};
use super::subscription::ActiveSubscription;
use super::transport::SyncTransport;
use crate::event::PresenceEvent;
use crate::model::OwnerId;
use crate::observability::MetricsRegistry;
use crate::store::StoreError;

/// Why a sync run did not complete cleanly.
#[derive(Debug, Error)]
pub enum RunError {
	#[error("{failed} of {attempted} pushes failed")]
	PushFailed { attempted: usize, failed: usize },

	#[error("remote store rejected this identity: {0}")]
	Rejected(String),

	#[error("queue persistence failed: {0}")]
	Storage(#[from] StoreError),
}

/// Everything background synchronization needs, shared between the
/// session, the periodic worker task and the subscription consumer.
pub(crate) struct SyncWorker {
	/// Identity of this session
	pub(crate) identity: OwnerId,
	pub(crate) transport: Arc<dyn SyncTransport>,
	pub(crate) engine: Arc<ReconciliationEngine>,
	pub(crate) queue: Arc<ChangeQueue>,
	pub(crate) events: broadcast::Sender<PresenceEvent>,
	pub(crate) metrics: Arc<MetricsRegistry>,
	/// Delay between attempts to re-establish a dropped subscription
	pub(crate) resubscribe_backoff: BackoffPolicy,
	controller: Mutex<ScheduleController>,
	/// Set after a permanent rejection; pushes pause until cleared
	auth_blocked: AtomicBool,
	/// Whether this identity currently shares its location. Follows the
	/// latest own record, including ones written by another session.
	pub(crate) sharing: AtomicBool,
	pub(crate) subscription: Mutex<Option<ActiveSubscription>>,
	wake: Notify,
}

impl SyncWorker {
	pub(crate) fn new(
		identity: OwnerId,
		transport: Arc<dyn SyncTransport>,
		engine: Arc<ReconciliationEngine>,
		queue: Arc<ChangeQueue>,
		controller: ScheduleController,
		events: broadcast::Sender<PresenceEvent>,
		metrics: Arc<MetricsRegistry>,
		sharing: bool,
	) -> Self {
		let resubscribe_backoff = queue.policy().backoff.clone();
		Self {
			identity,
			transport,
			engine,
			queue,
			events,
			metrics,
			resubscribe_backoff,
			controller: Mutex::new(controller),
			auth_blocked: AtomicBool::new(false),
			sharing: AtomicBool::new(sharing),
			subscription: Mutex::new(None),
			wake: Notify::new(),
		}
	}

	/// Publish an event. Having no listeners is fine.
	pub(crate) fn emit(&self, event: PresenceEvent) {
		let _ = self.events.send(event);
	}

	/// Ask the worker task to consider a run soon.
	pub(crate) fn trigger(&self) {
		self.wake.notify_one();
	}

	pub(crate) async fn set_presence_active(&self, active: bool) {
		self.controller.lock().await.set_presence_active(active);
	}

	pub(crate) fn is_auth_blocked(&self) -> bool {
		self.auth_blocked.load(Ordering::SeqCst)
	}

	/// Record a permanent rejection. Emits `AuthenticationRequired` only on
	/// the first rejection since the last resume.
	pub(crate) fn block_auth(&self, reason: String) {
		if !self.auth_blocked.swap(true, Ordering::SeqCst) {
			error!("{} was rejected by the remote store: {}", self.identity, reason);
			self.emit(PresenceEvent::AuthenticationRequired { reason });
		}
	}

	pub(crate) fn clear_auth_block(&self) -> bool {
		self.auth_blocked.swap(false, Ordering::SeqCst)
	}

	/// Report updates that will never be delivered.
	pub(crate) fn report_dropped(&self, dropped: Vec<DroppedUpdate>) {
		for d in dropped {
			let record_id = d.update.id();
			warn!("Giving up on update {}: {}", record_id, d.reason);
			self.metrics.delivery_failures_total.inc();
			self.emit(PresenceEvent::DeliveryFailed {
				record_id,
				reason: d.reason,
			});
		}
	}

	/// Feed one event to the scheduler and perform the run it asks for.
	/// Returns whether a run happened.
	pub(crate) async fn step(self: &Arc<Self>, event: ScheduleEvent) -> bool {
		match self.queue.expire(Utc::now()).await {
			Ok(expired) => self.report_dropped(expired),
			Err(e) => error!("Failed to persist queue after expiry: {}", e),
		}

		let ready = !self.is_auth_blocked() && self.queue.has_ready(Utc::now()).await;
		let decision = self
			.controller
			.lock()
			.await
			.handle(event, Instant::now(), ready);
		if decision != Decision::Run {
			return false;
		}

		let outcome = match self.run_once().await {
			Ok(()) => ScheduleEvent::RunSucceeded,
			Err(e) => {
				warn!("Sync run failed: {}", e);
				ScheduleEvent::RunFailed
			}
		};
		self.controller
			.lock()
			.await
			.handle(outcome, Instant::now(), false);
		true
	}

	/// Push ready updates in enqueue order and keep the subscription alive.
	pub(crate) async fn run_once(self: &Arc<Self>) -> Result<(), RunError> {
		self.metrics.sync_runs_total.inc();

		if self.ensure_subscription().await {
			debug!("Presence subscription restarted by sync run");
		}
		if self.is_auth_blocked() {
			return Err(RunError::Rejected(
				"paused until re-authentication".into(),
			));
		}

		let batch = self.queue.drain(Utc::now()).await;
		let attempted = batch.len();
		let mut failed = 0;
		let mut pending = batch.into_iter();

		while let Some(update) = pending.next() {
			let id = update.id();
			self.metrics.push_attempts_total.inc();
			let started = Instant::now();
			let result = self.transport.push(&update.record).await;
			self.metrics
				.push_latency_ms
				.observe(started.elapsed().as_secs_f64() * 1000.0);

			match result {
				Ok(()) => {
					self.metrics.push_successes_total.inc();
					self.queue.ack(&id).await?;
					debug!("Delivered {}", id);
				}
				Err(e) if e.is_permanent() => {
					self.metrics.push_failures_total.inc();
					// Nothing in this batch counts as attempted.
					self.queue.release(&id).await;
					for rest in pending.by_ref() {
						self.queue.release(&rest.id()).await;
					}
					let reason = match e {
						super::TransportError::PermanentRejection(reason) => reason,
						other => other.to_string(),
					};
					self.block_auth(reason.clone());
					return Err(RunError::Rejected(reason));
				}
				Err(e) => {
					self.metrics.push_failures_total.inc();
					failed += 1;
					match self.queue.fail(&id, Utc::now()).await? {
						Some(FailOutcome::Dropped(dropped)) => self.report_dropped(vec![dropped]),
						Some(FailOutcome::Retrying { attempt, .. }) => {
							info!("Push of {} failed (attempt {}): {}", id, attempt, e)
						}
						Some(FailOutcome::Superseded) | None => {
							debug!("Push of {} failed but a newer update is queued", id)
						}
					}
				}
			}
		}

		if failed > 0 {
			Err(RunError::PushFailed { attempted, failed })
		} else {
			Ok(())
		}
	}

	/// Spawn the periodic worker. It stops when `shutdown` flips or its
	/// sender is dropped.
	pub(crate) fn spawn(
		self: Arc<Self>,
		tick_interval: Duration,
		mut shutdown: watch::Receiver<bool>,
	) -> JoinHandle<()> {
		// Subscribe before spawning and replay the current value once, so a
		// change made before the task first runs is not lost.
		let mut connectivity = self.transport.watch_connectivity();
		connectivity.mark_changed();

		tokio::spawn(async move {
			let mut tick = interval(tick_interval);
			tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
			let mut watching = true;
			let mut last = self.controller.lock().await.connectivity();

			loop {
				let event = tokio::select! {
					_ = shutdown.changed() => break,
					_ = tick.tick() => ScheduleEvent::Tick,
					_ = self.wake.notified() => ScheduleEvent::Trigger,
					changed = connectivity.changed(), if watching => {
						if changed.is_err() {
							watching = false;
							continue;
						}
						let state = *connectivity.borrow_and_update();
						if state != last {
							info!("Connectivity changed to {}", state);
							self.emit(PresenceEvent::ConnectivityChanged(state));
							last = state;
						}
						ScheduleEvent::ConnectivityChanged(state)
					}
				};
				self.step(event).await;
			}

			self.close_subscription().await;
			debug!("Sync worker for {} stopped", self.identity);
		})
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::model::{Connectivity, HybridTimestamp, LocationRecord};
	use crate::store::{KeyValueStore, LocalStore, MemoryStore};
	use crate::sync::{
		DeliveryFailure, MemoryHub, QueuePolicy, SchedulePolicy, TieBreak, TransportError,
	};

	async fn worker(hub: &MemoryHub, policy: QueuePolicy) -> Arc<SyncWorker> {
		let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
		let metrics = Arc::new(MetricsRegistry::new().unwrap());
		let store = Arc::new(LocalStore::load(Arc::clone(&kv)).await.unwrap());
		let me = OwnerId::new("me");
		let engine = Arc::new(ReconciliationEngine::new(
			me.clone(),
			TieBreak::default(),
			store,
			Arc::clone(&metrics),
		));
		let queue = Arc::new(
			ChangeQueue::load(kv, policy, Arc::clone(&metrics))
				.await
				.unwrap(),
		);
		let schedule = SchedulePolicy {
			min_interval: Duration::ZERO,
			..SchedulePolicy::default()
		};
		let (events, _) = broadcast::channel(16);
		Arc::new(SyncWorker::new(
			me.clone(),
			Arc::new(hub.transport(me)),
			engine,
			queue,
			ScheduleController::new(schedule, Connectivity::Online),
			events,
			metrics,
			true,
		))
	}

	fn own(seq: u64) -> LocationRecord {
		LocationRecord::new(
			OwnerId::new("me"),
			seq,
			HybridTimestamp::new(seq as i64, 0),
			1.0,
			2.0,
			3.0,
		)
	}

	fn no_backoff() -> QueuePolicy {
		QueuePolicy {
			max_attempts: 2,
			backoff: BackoffPolicy {
				initial: Duration::ZERO,
				max: Duration::ZERO,
				jitter_percent: 0,
			},
			..QueuePolicy::default()
		}
	}

	#[tokio::test]
	async fn run_once_delivers_and_acks() {
		let hub = MemoryHub::new();
		let w = worker(&hub, QueuePolicy::default()).await;
		w.queue.enqueue(own(1), Utc::now()).await.unwrap();

		w.run_once().await.unwrap();
		assert!(w.queue.is_empty().await);
		assert_eq!(hub.record(&OwnerId::new("me")).await, Some(own(1)));
		assert_eq!(w.metrics.push_successes_total.get(), 1);
	}

	#[tokio::test]
	async fn exhausted_update_is_reported_once() {
		let hub = MemoryHub::new();
		let w = worker(&hub, no_backoff()).await;
		let mut events = w.events.subscribe();
		hub.fail_next_pushes(5, TransportError::Transient("503".into()))
			.await;
		w.queue.enqueue(own(1), Utc::now()).await.unwrap();

		assert!(matches!(
			w.run_once().await,
			Err(RunError::PushFailed { failed: 1, .. })
		));
		assert!(w.run_once().await.is_err());
		assert!(w.run_once().await.is_ok());
		assert!(w.queue.is_empty().await);

		let event = events.try_recv().unwrap();
		assert_eq!(
			event,
			PresenceEvent::DeliveryFailed {
				record_id: own(1).id(),
				reason: DeliveryFailure::AttemptsExhausted { attempts: 2 },
			}
		);
		assert!(events.try_recv().is_err());
		assert_eq!(w.metrics.delivery_failures_total.get(), 1);
	}

	#[tokio::test]
	async fn permanent_rejection_pauses_pushes_without_counting_attempts() {
		let hub = MemoryHub::new();
		let w = worker(&hub, QueuePolicy::default()).await;
		let mut events = w.events.subscribe();
		hub.revoke(&OwnerId::new("me")).await;
		w.queue.enqueue(own(1), Utc::now()).await.unwrap();

		assert!(matches!(w.run_once().await, Err(RunError::Rejected(_))));
		assert!(w.is_auth_blocked());
		let pending = w.queue.pending().await;
		assert_eq!(pending[0].attempt_count, 0);
		assert!(!pending[0].is_in_flight());

		// A second rejection does not emit again.
		w.block_auth("again".into());
		assert!(matches!(
			events.try_recv(),
			Ok(PresenceEvent::AuthenticationRequired { .. })
		));
		assert!(events.try_recv().is_err());

		// Paused: the scheduler sees no ready work, and a forced run does
		// not count as a success.
		assert!(!w.step(ScheduleEvent::Trigger).await);
		assert!(matches!(w.run_once().await, Err(RunError::Rejected(_))));
		assert_eq!(w.queue.pending().await[0].attempt_count, 0);
	}

	#[tokio::test]
	async fn step_runs_only_when_scheduler_allows() {
		let hub = MemoryHub::new();
		let w = worker(&hub, QueuePolicy::default()).await;
		assert!(!w.step(ScheduleEvent::Trigger).await);

		w.queue.enqueue(own(1), Utc::now()).await.unwrap();
		assert!(w.step(ScheduleEvent::Trigger).await);
		assert_eq!(hub.push_count(), 1);
	}
}
