pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod observability;
pub mod session;
pub mod simulate;
pub mod store;
pub mod sync;

pub use config::{Settings, SyncPolicy};
pub use error::{PresenceError, Result};
pub use event::PresenceEvent;
pub use model::{
	Connectivity, HybridClock, HybridTimestamp, LocationRecord, OwnerId, PeerSubscription,
	PendingUpdate, RecordId,
};
pub use session::{ChangeSubscription, PresenceSession};
pub use store::{FileStore, KeyValueStore, LocalStore, MemoryStore, StoreError};
pub use sync::{MemoryHub, SyncTransport, TransportError};
