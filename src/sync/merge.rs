use std::str::FromStr;
use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::model::{HybridTimestamp, LocationRecord, OwnerId};
use crate::observability::MetricsRegistry;
use crate::store::{LocalStore, StoreError};

/// How two records with the same sequence number but different timestamps
/// are resolved for peer owners. The local owner always keeps its own
/// record in that case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
	/// The higher hybrid timestamp wins. Final state is independent of
	/// delivery order.
	#[default]
	WallClock,
	/// The record already stored wins. Final state depends on delivery
	/// order for equal sequence numbers.
	PreferStored,
}

impl FromStr for TieBreak {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"wall_clock" | "wallclock" => Ok(TieBreak::WallClock),
			"prefer_stored" | "preferstored" => Ok(TieBreak::PreferStored),
			other => Err(format!("unknown tie-break policy: {}", other)),
		}
	}
}

/// Outcome of merging one incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
	Applied,
	RejectedStale,
	RejectedDuplicate,
}

impl MergeResult {
	pub fn is_applied(self) -> bool {
		matches!(self, MergeResult::Applied)
	}
}

/// Per-owner bookkeeping used to reject stale and duplicate deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationState {
	pub last_applied_sequence: u64,
	pub last_applied_timestamp: HybridTimestamp,
}

/// Decide how `incoming` relates to the currently stored record.
///
/// Sequence numbers are authoritative; timestamps only break ties between
/// equal sequence numbers.
pub fn resolve(
	local_owner: &OwnerId,
	tie_break: TieBreak,
	stored: Option<&LocationRecord>,
	incoming: &LocationRecord,
) -> MergeResult {
	let Some(stored) = stored else {
		return MergeResult::Applied;
	};

	if incoming.sequence > stored.sequence {
		return MergeResult::Applied;
	}
	if incoming.sequence < stored.sequence {
		return MergeResult::RejectedStale;
	}
	if incoming.timestamp == stored.timestamp {
		return MergeResult::RejectedDuplicate;
	}

	// Same sequence, different timestamps.
	if &incoming.owner == local_owner {
		return MergeResult::RejectedStale;
	}
	match tie_break {
		TieBreak::WallClock if incoming.timestamp > stored.timestamp => MergeResult::Applied,
		_ => MergeResult::RejectedStale,
	}
}

/// Merges local samples and remote deliveries into the `LocalStore`.
///
/// This is the only writer of the store. Each merge holds just the
/// affected owner's slot lock, so merges for different owners proceed in
/// parallel while merges for one owner are serialized.
pub struct ReconciliationEngine {
	local_owner: OwnerId,
	tie_break: TieBreak,
	store: Arc<LocalStore>,
	metrics: Arc<MetricsRegistry>,
}

impl ReconciliationEngine {
	pub fn new(
		local_owner: OwnerId,
		tie_break: TieBreak,
		store: Arc<LocalStore>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		Self {
			local_owner,
			tie_break,
			store,
			metrics,
		}
	}

	pub fn local_owner(&self) -> &OwnerId {
		&self.local_owner
	}

	pub fn store(&self) -> &Arc<LocalStore> {
		&self.store
	}

	/// Merge a record delivered by the transport. The record is persisted
	/// before it becomes visible to readers; a persistence failure leaves
	/// the previous record in place.
	pub async fn merge(&self, incoming: LocationRecord) -> Result<MergeResult, StoreError> {
		self.apply(incoming, true).await
	}

	/// Merge a record produced by this session.
	pub async fn merge_local(&self, record: LocationRecord) -> Result<MergeResult, StoreError> {
		self.apply(record, false).await
	}

	async fn apply(&self, incoming: LocationRecord, remote: bool) -> Result<MergeResult, StoreError> {
		let slot = self.store.slot(&incoming.owner).await;
		let mut current = slot.lock().await;

		let outcome = resolve(&self.local_owner, self.tie_break, current.as_ref(), &incoming);
		match outcome {
			MergeResult::Applied => {
				self.store.persist(&incoming).await?;
				if remote && incoming.owner == self.local_owner {
					info!(
						"Own location resynchronized from another session: seq {:?} -> {}",
						current.as_ref().map(|c| c.sequence),
						incoming.sequence
					);
				} else {
					debug!(
						"Applied {} (seq {}, ts {})",
						incoming.owner, incoming.sequence, incoming.timestamp
					);
				}
				self.metrics.merges_applied_total.inc();
				*current = Some(incoming);
			}
			MergeResult::RejectedStale => {
				debug!(
					"Ignoring stale record for {} (seq {}, ts {})",
					incoming.owner, incoming.sequence, incoming.timestamp
				);
				self.metrics.merges_stale_total.inc();
			}
			MergeResult::RejectedDuplicate => {
				debug!(
					"Ignoring duplicate record for {} (seq {})",
					incoming.owner, incoming.sequence
				);
				self.metrics.merges_duplicate_total.inc();
			}
		}
		Ok(outcome)
	}

	/// Last applied sequence and timestamp for `owner`.
	pub async fn state(&self, owner: &OwnerId) -> Option<ReconciliationState> {
		self.store.get(owner).await.map(|r| ReconciliationState {
			last_applied_sequence: r.sequence,
			last_applied_timestamp: r.timestamp,
		})
	}
}
