use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::backoff::BackoffPolicy;
use crate::model::{LocationRecord, OwnerId, PendingUpdate, RecordId};
use crate::observability::MetricsRegistry;
use crate::store::{KeyValueStore, StoreError, load_json, save_json};

const QUEUE_KEY: &str = "queue/pending";

/// Limits applied to the outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePolicy {
	/// Maximum number of pending updates kept.
	pub capacity: usize,
	/// Failed attempts after which an update is dropped and reported.
	pub max_attempts: u32,
	/// Pending updates older than this are dropped and reported.
	pub ttl: Option<Duration>,
	pub backoff: BackoffPolicy,
}

impl Default for QueuePolicy {
	fn default() -> Self {
		Self {
			capacity: 256,
			max_attempts: 8,
			ttl: None,
			backoff: BackoffPolicy::default(),
		}
	}
}

/// Why an update left the queue without being acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryFailure {
	AttemptsExhausted { attempts: u32 },
	Expired,
	QueueOverflow,
}

impl fmt::Display for DeliveryFailure {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DeliveryFailure::AttemptsExhausted { attempts } => {
				write!(f, "gave up after {} attempts", attempts)
			}
			DeliveryFailure::Expired => f.write_str("expired before delivery"),
			DeliveryFailure::QueueOverflow => f.write_str("dropped on queue overflow"),
		}
	}
}

/// An update removed from the queue without delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedUpdate {
	pub update: PendingUpdate,
	pub reason: DeliveryFailure,
}

/// Result of `ChangeQueue::enqueue`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOutcome {
	/// False when a newer record for the same owner was already queued.
	pub accepted: bool,
	/// Older queued update this one replaced.
	pub superseded: Option<RecordId>,
	/// Updates evicted to stay within capacity that were the latest for
	/// their owner.
	pub dropped: Vec<DroppedUpdate>,
}

/// Result of `ChangeQueue::fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
	Retrying {
		attempt: u32,
		next_retry_at: DateTime<Utc>,
	},
	/// A newer update for the owner is queued; this one was discarded.
	Superseded,
	Dropped(DroppedUpdate),
}

/// Durable queue of outbound updates.
///
/// Entries keep enqueue order. At most one entry per owner is waiting;
/// an owner may additionally have one older entry in flight.
pub struct ChangeQueue {
	kv: Arc<dyn KeyValueStore>,
	policy: QueuePolicy,
	metrics: Arc<MetricsRegistry>,
	entries: Mutex<VecDeque<PendingUpdate>>,
}

impl ChangeQueue {
	/// Restore the queue persisted in `kv`, if any. Nothing is in flight
	/// after a restore.
	pub async fn load(
		kv: Arc<dyn KeyValueStore>,
		policy: QueuePolicy,
		metrics: Arc<MetricsRegistry>,
	) -> Result<Self, StoreError> {
		let restored: Vec<PendingUpdate> = load_json(kv.as_ref(), QUEUE_KEY)
			.await?
			.unwrap_or_default();
		if !restored.is_empty() {
			debug!("Restored {} pending updates", restored.len());
		}
		metrics.queue_depth.set(restored.len() as i64);

		Ok(Self {
			kv,
			policy,
			metrics,
			entries: Mutex::new(restored.into()),
		})
	}

	pub fn policy(&self) -> &QueuePolicy {
		&self.policy
	}

	async fn persist(&self, entries: &VecDeque<PendingUpdate>) -> Result<(), StoreError> {
		self.metrics.queue_depth.set(entries.len() as i64);
		let snapshot: Vec<&PendingUpdate> = entries.iter().collect();
		save_json(self.kv.as_ref(), QUEUE_KEY, &snapshot).await
	}

	/// Queue `record` for transmission, collapsing any older waiting update
	/// for the same owner.
	pub async fn enqueue(
		&self,
		record: LocationRecord,
		now: DateTime<Utc>,
	) -> Result<EnqueueOutcome, StoreError> {
		let mut entries = self.entries.lock().await;

		if entries
			.iter()
			.any(|e| e.record.owner == record.owner && e.record.sequence >= record.sequence)
		{
			debug!("Not queueing {}: a newer update is already queued", record.id());
			return Ok(EnqueueOutcome::default());
		}

		let mut superseded = None;
		entries.retain(|e| {
			if e.record.owner == record.owner && !e.in_flight {
				superseded = Some(e.id());
				false
			} else {
				true
			}
		});
		if let Some(old) = &superseded {
			debug!("Collapsed {} into {}", old, record.id());
		}

		entries.push_back(PendingUpdate::new(record, now));
		let dropped = self.enforce_capacity(&mut entries);
		self.persist(&entries).await?;

		Ok(EnqueueOutcome {
			accepted: true,
			superseded,
			dropped,
		})
	}

	fn enforce_capacity(&self, entries: &mut VecDeque<PendingUpdate>) -> Vec<DroppedUpdate> {
		let mut dropped = Vec::new();
		while entries.len() > self.policy.capacity.max(1) {
			let superseded = (0..entries.len()).find(|&i| {
				entries
					.iter()
					.skip(i + 1)
					.any(|later| later.record.owner == entries[i].record.owner)
			});
			if let Some(i) = superseded {
				if let Some(update) = entries.remove(i) {
					debug!("Queue full, evicted superseded update {}", update.id());
				}
				continue;
			}

			// Every entry is now the latest for its owner; the oldest goes even
			// when in flight. A late ack or fail for it finds nothing queued.
			if let Some(update) = entries.pop_front() {
				warn!("Queue full, dropping update {}", update.id());
				dropped.push(DroppedUpdate {
					update,
					reason: DeliveryFailure::QueueOverflow,
				});
			}
		}
		dropped
	}

	/// Updates ready to transmit at `now`, in enqueue order. Returned
	/// updates are marked in flight until `ack`, `fail` or `release`.
	pub async fn drain(&self, now: DateTime<Utc>) -> Vec<PendingUpdate> {
		let mut entries = self.entries.lock().await;
		let busy: HashSet<OwnerId> = entries
			.iter()
			.filter(|e| e.in_flight)
			.map(|e| e.record.owner.clone())
			.collect();

		let mut ready = Vec::new();
		for entry in entries.iter_mut() {
			if !entry.in_flight && entry.next_retry_at <= now && !busy.contains(&entry.record.owner)
			{
				entry.in_flight = true;
				ready.push(entry.clone());
			}
		}
		ready
	}

	/// Remove an acknowledged update. Returns false if it was no longer
	/// queued.
	pub async fn ack(&self, id: &RecordId) -> Result<bool, StoreError> {
		let mut entries = self.entries.lock().await;
		let Some(pos) = entries.iter().position(|e| &e.id() == id) else {
			return Ok(false);
		};
		entries.remove(pos);
		self.persist(&entries).await?;
		Ok(true)
	}

	/// Record a failed transmission. Returns `None` if the update was no
	/// longer queued.
	pub async fn fail(
		&self,
		id: &RecordId,
		now: DateTime<Utc>,
	) -> Result<Option<FailOutcome>, StoreError> {
		let mut entries = self.entries.lock().await;
		let Some(pos) = entries.iter().position(|e| &e.id() == id) else {
			return Ok(None);
		};

		let newer_queued = entries
			.iter()
			.any(|e| e.record.owner == id.owner && e.record.sequence > id.sequence);
		if newer_queued {
			entries.remove(pos);
			self.persist(&entries).await?;
			return Ok(Some(FailOutcome::Superseded));
		}

		let entry = &mut entries[pos];
		entry.in_flight = false;
		entry.attempt_count += 1;
		let attempt = entry.attempt_count;

		if attempt >= self.policy.max_attempts {
			let outcome = entries.remove(pos).map(|update| {
				FailOutcome::Dropped(DroppedUpdate {
					update,
					reason: DeliveryFailure::AttemptsExhausted { attempts: attempt },
				})
			});
			self.persist(&entries).await?;
			return Ok(outcome);
		}

		let delay = self.policy.backoff.delay(attempt);
		let next_retry_at = chrono::Duration::from_std(delay)
			.ok()
			.and_then(|d| now.checked_add_signed(d))
			.unwrap_or(now);
		entry.next_retry_at = next_retry_at;
		debug!("Update {} failed (attempt {}), retry at {}", id, attempt, next_retry_at);

		self.persist(&entries).await?;
		Ok(Some(FailOutcome::Retrying {
			attempt,
			next_retry_at,
		}))
	}

	/// Return an in-flight update to the queue without counting an attempt.
	pub async fn release(&self, id: &RecordId) -> bool {
		let mut entries = self.entries.lock().await;
		match entries.iter_mut().find(|e| &e.id() == id) {
			Some(entry) => {
				entry.in_flight = false;
				true
			}
			None => false,
		}
	}

	/// Drop waiting updates older than the configured TTL.
	pub async fn expire(&self, now: DateTime<Utc>) -> Result<Vec<DroppedUpdate>, StoreError> {
		let Some(ttl) = self.policy.ttl else {
			return Ok(Vec::new());
		};
		let Ok(ttl) = chrono::Duration::from_std(ttl) else {
			return Ok(Vec::new());
		};

		let mut entries = self.entries.lock().await;
		let mut expired = Vec::new();
		let mut kept = VecDeque::with_capacity(entries.len());
		for update in entries.drain(..) {
			if !update.in_flight && now - update.enqueued_at > ttl {
				warn!("Pending update {} expired", update.id());
				expired.push(DroppedUpdate {
					update,
					reason: DeliveryFailure::Expired,
				});
			} else {
				kept.push_back(update);
			}
		}
		*entries = kept;

		if !expired.is_empty() {
			self.persist(&entries).await?;
		}
		Ok(expired)
	}

	/// Drop waiting updates for `owner` at or below `sequence`. Used when a
	/// newer own record arrives from another session of the same identity.
	pub async fn discard_through(
		&self,
		owner: &OwnerId,
		sequence: u64,
	) -> Result<usize, StoreError> {
		let mut entries = self.entries.lock().await;
		let before = entries.len();
		entries.retain(|e| !(&e.record.owner == owner && !e.in_flight && e.record.sequence <= sequence));
		let removed = before - entries.len();
		if removed > 0 {
			debug!("Discarded {} superseded own updates through seq {}", removed, sequence);
			self.persist(&entries).await?;
		}
		Ok(removed)
	}

	/// True if some waiting update may be transmitted at `now`.
	pub async fn has_ready(&self, now: DateTime<Utc>) -> bool {
		let entries = self.entries.lock().await;
		let busy: HashSet<&OwnerId> = entries
			.iter()
			.filter(|e| e.in_flight)
			.map(|e| &e.record.owner)
			.collect();
		entries
			.iter()
			.any(|e| !e.in_flight && e.next_retry_at <= now && !busy.contains(&e.record.owner))
	}

	pub async fn len(&self) -> usize {
		self.entries.lock().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.lock().await.is_empty()
	}

	/// Copy of all queued updates in order.
	pub async fn pending(&self) -> Vec<PendingUpdate> {
		self.entries.lock().await.iter().cloned().collect()
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::model::HybridTimestamp;
	use crate::store::MemoryStore;

	fn rec(owner: &str, seq: u64) -> LocationRecord {
		LocationRecord::new(
			OwnerId::new(owner),
			seq,
			HybridTimestamp::new(seq as i64, 0),
			1.0,
			2.0,
			3.0,
		)
	}

	fn policy() -> QueuePolicy {
		QueuePolicy {
			capacity: 16,
			max_attempts: 3,
			ttl: None,
			backoff: BackoffPolicy {
				initial: Duration::from_secs(1),
				max: Duration::from_secs(8),
				jitter_percent: 0,
			},
		}
	}

	async fn queue_with(policy: QueuePolicy) -> (ChangeQueue, Arc<dyn KeyValueStore>) {
		let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
		let metrics = Arc::new(MetricsRegistry::new().unwrap());
		let queue = ChangeQueue::load(Arc::clone(&kv), policy, metrics).await.unwrap();
		(queue, kv)
	}

	#[tokio::test]
	async fn enqueue_drain_ack_empties_queue() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();

		queue.enqueue(rec("me", 1), now).await.unwrap();
		let batch = queue.drain(now).await;
		assert_eq!(batch.len(), 1);
		assert!(batch[0].is_in_flight());

		assert!(queue.ack(&batch[0].id()).await.unwrap());
		assert!(queue.is_empty().await);
		assert!(!queue.ack(&batch[0].id()).await.unwrap());
	}

	#[tokio::test]
	async fn newer_sample_collapses_waiting_one() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();

		queue.enqueue(rec("me", 1), now).await.unwrap();
		let outcome = queue.enqueue(rec("me", 2), now).await.unwrap();
		assert!(outcome.accepted);
		assert_eq!(outcome.superseded.map(|id| id.sequence), Some(1));

		let batch = queue.drain(now).await;
		assert_eq!(batch.len(), 1);
		assert_eq!(batch[0].record.sequence, 2);
	}

	#[tokio::test]
	async fn older_sample_is_ignored() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();

		queue.enqueue(rec("me", 5), now).await.unwrap();
		let outcome = queue.enqueue(rec("me", 4), now).await.unwrap();
		assert!(!outcome.accepted);
		assert_eq!(queue.len().await, 1);
	}

	#[tokio::test]
	async fn in_flight_update_blocks_owner_and_is_superseded_on_failure() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();

		queue.enqueue(rec("me", 1), now).await.unwrap();
		let first = queue.drain(now).await;
		queue.enqueue(rec("me", 2), now).await.unwrap();
		assert_eq!(queue.len().await, 2);

		// The owner is busy until the in-flight update resolves.
		assert!(queue.drain(now).await.is_empty());

		let outcome = queue.fail(&first[0].id(), now).await.unwrap();
		assert_eq!(outcome, Some(FailOutcome::Superseded));

		let next = queue.drain(now).await;
		assert_eq!(next.len(), 1);
		assert_eq!(next[0].record.sequence, 2);
	}

	#[tokio::test]
	async fn failures_back_off_then_drop_exactly_once() {
		let (queue, _) = queue_with(policy()).await;
		let mut now = Utc::now();
		queue.enqueue(rec("me", 1), now).await.unwrap();

		let mut dropped = Vec::new();
		for _ in 0..3 {
			let batch = queue.drain(now).await;
			assert_eq!(batch.len(), 1);

			match queue.fail(&batch[0].id(), now).await.unwrap() {
				Some(FailOutcome::Retrying { next_retry_at, .. }) => {
					assert!(queue.drain(now).await.is_empty());
					now = next_retry_at;
				}
				Some(FailOutcome::Dropped(d)) => dropped.push(d),
				other => panic!("unexpected outcome {:?}", other),
			}
		}

		assert_eq!(dropped.len(), 1);
		assert_eq!(
			dropped[0].reason,
			DeliveryFailure::AttemptsExhausted { attempts: 3 }
		);
		assert!(queue.is_empty().await);
		assert!(queue.drain(now + chrono::Duration::days(1)).await.is_empty());
	}

	#[tokio::test]
	async fn retry_delay_grows_exponentially() {
		let (queue, _) = queue_with(QueuePolicy {
			max_attempts: 10,
			..policy()
		})
		.await;
		let now = Utc::now();
		queue.enqueue(rec("me", 1), now).await.unwrap();

		let mut delays = Vec::new();
		let mut at = now;
		for _ in 0..3 {
			let batch = queue.drain(at).await;
			if let Some(FailOutcome::Retrying { next_retry_at, .. }) =
				queue.fail(&batch[0].id(), at).await.unwrap()
			{
				delays.push((next_retry_at - at).num_seconds());
				at = next_retry_at;
			}
		}
		assert_eq!(delays, vec![1, 2, 4]);
	}

	#[tokio::test]
	async fn overflow_evicts_oldest_owner_update_and_reports_it() {
		let (queue, _) = queue_with(QueuePolicy {
			capacity: 2,
			..policy()
		})
		.await;
		let now = Utc::now();

		queue.enqueue(rec("a", 1), now).await.unwrap();
		queue.enqueue(rec("b", 1), now).await.unwrap();
		let outcome = queue.enqueue(rec("c", 1), now).await.unwrap();

		assert_eq!(outcome.dropped.len(), 1);
		assert_eq!(outcome.dropped[0].update.owner().as_str(), "a");
		assert_eq!(outcome.dropped[0].reason, DeliveryFailure::QueueOverflow);
		assert_eq!(queue.len().await, 2);
	}

	#[tokio::test]
	async fn overflow_prefers_superseded_in_flight_entries() {
		let (queue, _) = queue_with(QueuePolicy {
			capacity: 2,
			..policy()
		})
		.await;
		let now = Utc::now();

		queue.enqueue(rec("a", 1), now).await.unwrap();
		queue.drain(now).await;
		queue.enqueue(rec("a", 2), now).await.unwrap();
		let outcome = queue.enqueue(rec("b", 1), now).await.unwrap();

		assert!(outcome.dropped.is_empty());
		let left: Vec<String> = queue
			.pending()
			.await
			.iter()
			.map(|p| p.id().to_string())
			.collect();
		assert_eq!(left, vec!["a#2".to_string(), "b#1".to_string()]);
	}

	#[tokio::test]
	async fn overflow_drops_oldest_even_when_in_flight() {
		let (queue, _) = queue_with(QueuePolicy {
			capacity: 2,
			..policy()
		})
		.await;
		let now = Utc::now();

		queue.enqueue(rec("a", 1), now).await.unwrap();
		queue.enqueue(rec("b", 1), now).await.unwrap();
		let batch = queue.drain(now).await;
		assert_eq!(batch.len(), 2);

		let outcome = queue.enqueue(rec("c", 1), now).await.unwrap();
		let dropped: Vec<String> = outcome
			.dropped
			.iter()
			.map(|d| d.update.id().to_string())
			.collect();
		assert_eq!(dropped, vec!["a#1".to_string()]);

		// The evicted push resolving later is a no-op.
		assert!(!queue.ack(&batch[0].id()).await.unwrap());
		assert_eq!(queue.fail(&batch[0].id(), now).await.unwrap(), None);
		let left: Vec<String> = queue
			.pending()
			.await
			.iter()
			.map(|p| p.id().to_string())
			.collect();
		assert_eq!(left, vec!["b#1".to_string(), "c#1".to_string()]);
	}

	#[tokio::test]
	async fn ttl_expires_waiting_updates() {
		let (queue, _) = queue_with(QueuePolicy {
			ttl: Some(Duration::from_secs(60)),
			..policy()
		})
		.await;
		let now = Utc::now();
		queue.enqueue(rec("a", 1), now).await.unwrap();
		queue.enqueue(rec("b", 1), now + chrono::Duration::seconds(50)).await.unwrap();

		let expired = queue.expire(now + chrono::Duration::seconds(61)).await.unwrap();
		assert_eq!(expired.len(), 1);
		assert_eq!(expired[0].reason, DeliveryFailure::Expired);
		assert_eq!(queue.len().await, 1);
	}

	#[tokio::test]
	async fn queue_survives_restart_without_in_flight_marks() {
		let (queue, kv) = queue_with(policy()).await;
		let now = Utc::now();
		queue.enqueue(rec("a", 1), now).await.unwrap();
		queue.enqueue(rec("b", 4), now).await.unwrap();
		queue.drain(now).await;
		drop(queue);

		let metrics = Arc::new(MetricsRegistry::new().unwrap());
		let restored = ChangeQueue::load(kv, policy(), metrics).await.unwrap();
		assert_eq!(restored.len().await, 2);
		assert_eq!(restored.drain(now).await.len(), 2);
	}

	#[tokio::test]
	async fn discard_through_removes_only_waiting_own_updates() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();
		queue.enqueue(rec("me", 3), now).await.unwrap();
		queue.enqueue(rec("peer", 9), now).await.unwrap();

		assert_eq!(queue.discard_through(&OwnerId::new("me"), 5).await.unwrap(), 1);
		assert_eq!(queue.len().await, 1);
		assert_eq!(queue.pending().await[0].owner().as_str(), "peer");
	}

	#[tokio::test]
	async fn release_returns_update_without_counting_attempt() {
		let (queue, _) = queue_with(policy()).await;
		let now = Utc::now();
		queue.enqueue(rec("me", 1), now).await.unwrap();

		let batch = queue.drain(now).await;
		assert!(!queue.has_ready(now).await);
		assert!(queue.release(&batch[0].id()).await);
		assert!(queue.has_ready(now).await);
		assert_eq!(queue.pending().await[0].attempt_count, 0);
	}
}
