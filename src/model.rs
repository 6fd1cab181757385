use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identifier of the peer a location record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for OwnerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for OwnerId {
	fn from(id: &str) -> Self {
		Self::new(id)
	}
}

impl From<String> for OwnerId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

/// Hybrid timestamp: wall-clock milliseconds plus a logical counter that
/// disambiguates samples taken within the same millisecond (or while the
/// wall clock runs backwards).
///
/// Ordering compares the wall clock first, then the logical counter.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct HybridTimestamp {
	/// Unix epoch milliseconds.
	pub wall_ms: i64,
	pub logical: u32,
}

impl HybridTimestamp {
	pub fn new(wall_ms: i64, logical: u32) -> Self {
		Self { wall_ms, logical }
	}

	/// Wall-clock component as a UTC time, when representable.
	pub fn wall_time(&self) -> Option<DateTime<Utc>> {
		DateTime::from_timestamp_millis(self.wall_ms)
	}
}

impl fmt::Display for HybridTimestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.{}", self.wall_ms, self.logical)
	}
}

/// Source of monotonically increasing hybrid timestamps for one writer.
#[derive(Debug, Clone, Default)]
pub struct HybridClock {
	last: HybridTimestamp,
}

impl HybridClock {
	pub fn new() -> Self {
		Self::default()
	}

	/// Start from a previously issued timestamp, e.g. the last persisted
	/// own record, so restarts never go backwards.
	pub fn seeded(last: HybridTimestamp) -> Self {
		Self { last }
	}

	/// Fold an observed timestamp into the clock.
	pub fn observe(&mut self, ts: HybridTimestamp) {
		if ts > self.last {
			self.last = ts;
		}
	}

	/// Next timestamp using the system clock.
	pub fn now(&mut self) -> HybridTimestamp {
		self.tick(Utc::now().timestamp_millis())
	}

	/// Next timestamp for the given wall-clock reading.
	pub fn tick(&mut self, wall_ms: i64) -> HybridTimestamp {
		let next = if wall_ms > self.last.wall_ms {
			HybridTimestamp::new(wall_ms, 0)
		} else {
			HybridTimestamp::new(self.last.wall_ms, self.last.logical.saturating_add(1))
		};
		self.last = next;
		next
	}
}

fn default_sharing() -> bool {
	true
}

/// Last-known location of one owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationRecord {
	pub owner: OwnerId,
	pub timestamp: HybridTimestamp,
	pub latitude: f64,
	pub longitude: f64,
	/// Horizontal accuracy radius in meters.
	pub accuracy: f64,
	/// Per-owner monotonic counter; authoritative over the wall clock.
	pub sequence: u64,
	/// False when the owner withdrew its location. Coordinates of a
	/// withdrawal carry no meaning.
	#[serde(default = "default_sharing")]
	pub sharing: bool,
}

impl LocationRecord {
	pub fn new(
		owner: OwnerId,
		sequence: u64,
		timestamp: HybridTimestamp,
		latitude: f64,
		longitude: f64,
		accuracy: f64,
	) -> Self {
		Self {
			owner,
			timestamp,
			latitude,
			longitude,
			accuracy,
			sequence,
			sharing: true,
		}
	}

	/// A record announcing that the owner stopped sharing its location.
	pub fn withdrawal(owner: OwnerId, sequence: u64, timestamp: HybridTimestamp) -> Self {
		Self {
			owner,
			timestamp,
			latitude: 0.0,
			longitude: 0.0,
			accuracy: 0.0,
			sequence,
			sharing: false,
		}
	}

	pub fn id(&self) -> RecordId {
		RecordId {
			owner: self.owner.clone(),
			sequence: self.sequence,
		}
	}

	/// Ordering key used for retention: sequence first, timestamp second.
	pub fn version(&self) -> (u64, HybridTimestamp) {
		(self.sequence, self.timestamp)
	}
}

/// Identifies one pending outbound update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId {
	pub owner: OwnerId,
	pub sequence: u64,
}

impl fmt::Display for RecordId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}#{}", self.owner, self.sequence)
	}
}

/// An outbound record waiting for remote acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
	pub record: LocationRecord,
	pub enqueued_at: DateTime<Utc>,
	pub attempt_count: u32,
	pub next_retry_at: DateTime<Utc>,
	/// Set between `drain` and `ack`/`fail`. Not persisted: after a
	/// restart nothing is in flight.
	#[serde(skip)]
	pub(crate) in_flight: bool,
}

impl PendingUpdate {
	pub fn new(record: LocationRecord, now: DateTime<Utc>) -> Self {
		Self {
			record,
			enqueued_at: now,
			attempt_count: 0,
			next_retry_at: now,
			in_flight: false,
		}
	}

	pub fn id(&self) -> RecordId {
		self.record.id()
	}

	pub fn owner(&self) -> &OwnerId {
		&self.record.owner
	}

	pub fn is_in_flight(&self) -> bool {
		self.in_flight
	}
}

/// The set of peers a session follows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSubscription {
	pub peer_ids: BTreeSet<OwnerId>,
	pub active: bool,
}

impl PeerSubscription {
	pub fn new(peer_ids: impl IntoIterator<Item = OwnerId>) -> Self {
		Self {
			peer_ids: peer_ids.into_iter().collect(),
			active: true,
		}
	}
}

/// Connectivity reported by the realtime channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Connectivity {
	Online,
	Offline,
	/// Connected but unreliable; treated as not online for scheduling.
	Degraded,
}

impl Connectivity {
	pub fn is_online(self) -> bool {
		matches!(self, Connectivity::Online)
	}
}

impl fmt::Display for Connectivity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Connectivity::Online => "online",
			Connectivity::Offline => "offline",
			Connectivity::Degraded => "degraded",
		};
		f.write_str(s)
	}
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn hybrid_clock_is_monotonic_when_wall_clock_stalls() {
		let mut clock = HybridClock::new();
		let a = clock.tick(1_000);
		let b = clock.tick(1_000);
		let c = clock.tick(900);
		let d = clock.tick(1_001);

		assert!(a < b);
		assert!(b < c);
		assert!(c < d);
		assert_eq!(c, HybridTimestamp::new(1_000, 2));
		assert_eq!(d, HybridTimestamp::new(1_001, 0));
	}

	#[test]
	fn seeded_clock_never_goes_backwards() {
		let mut clock = HybridClock::seeded(HybridTimestamp::new(5_000, 3));
		assert_eq!(clock.tick(4_000), HybridTimestamp::new(5_000, 4));

		clock.observe(HybridTimestamp::new(7_000, 0));
		assert_eq!(clock.tick(6_000), HybridTimestamp::new(7_000, 1));
	}

	#[test]
	fn record_version_orders_by_sequence_before_timestamp() {
		let owner = OwnerId::new("alice");
		let early_high_seq =
			LocationRecord::new(owner.clone(), 4, HybridTimestamp::new(10, 0), 1.0, 2.0, 5.0);
		let late_low_seq =
			LocationRecord::new(owner, 3, HybridTimestamp::new(99, 0), 1.0, 2.0, 5.0);

		assert!(early_high_seq.version() > late_low_seq.version());
	}

	#[test]
	fn pending_update_in_flight_flag_is_not_persisted() {
		let record = LocationRecord::new(
			OwnerId::new("bob"),
			1,
			HybridTimestamp::new(1, 0),
			10.0,
			20.0,
			3.0,
		);
		let mut pending = PendingUpdate::new(record, Utc::now());
		pending.in_flight = true;

		let json = serde_json::to_string(&pending).unwrap();
		let restored: PendingUpdate = serde_json::from_str(&json).unwrap();
		assert!(!restored.is_in_flight());
		assert_eq!(restored.id().to_string(), "bob#1");
	}

	#[test]
	fn legacy_record_without_sharing_flag_defaults_to_sharing() {
		let json = r#"{"owner":"carol","timestamp":{"wall_ms":1,"logical":0},"latitude":1.0,"longitude":2.0,"accuracy":3.0,"sequence":7}"#;
		let record: LocationRecord = serde_json::from_str(json).unwrap();
		assert!(record.sharing);
		assert_eq!(record.owner.as_str(), "carol");
	}
}
