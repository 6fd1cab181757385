use crate::model::{Connectivity, LocationRecord, OwnerId, RecordId};
use crate::sync::DeliveryFailure;

/// Change notifications published by a `PresenceSession`.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
	/// A newer record was applied for an owner that shares its location.
	LocationChanged(LocationRecord),
	/// The owner stopped sharing its location.
	SharingWithdrawn(OwnerId),
	/// An outbound update was given up on. Emitted once per update.
	DeliveryFailed {
		record_id: RecordId,
		reason: DeliveryFailure,
	},
	/// The remote store rejected this identity. Pushes stay paused until
	/// the session is resumed after re-authentication.
	AuthenticationRequired { reason: String },
	ConnectivityChanged(Connectivity),
}

impl PresenceEvent {
	/// Event announcing an applied record.
	pub(crate) fn for_applied(record: LocationRecord) -> Self {
		if record.sharing {
			PresenceEvent::LocationChanged(record)
		} else {
			PresenceEvent::SharingWithdrawn(record.owner)
		}
	}
}
