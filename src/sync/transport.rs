use std::collections::BTreeSet;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use tokio::sync::watch;

use crate::model::{Connectivity, LocationRecord, OwnerId};

/// Remote deliveries for a subscription. Ends when the channel drops the
/// subscription (e.g. on disconnect); callers re-subscribe to resume.
pub type RecordStream = Pin<Box<dyn Stream<Item = LocationRecord> + Send>>;

/// Failures reported by the realtime channel.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
	/// Worth retrying later.
	#[error("transient transport failure: {0}")]
	Transient(String),

	#[error("channel is offline")]
	Offline,

	/// The remote store refuses this identity (e.g. revoked credentials).
	/// Retrying without re-authenticating cannot succeed.
	#[error("permanently rejected: {0}")]
	PermanentRejection(String),
}

impl TransportError {
	pub fn is_permanent(&self) -> bool {
		matches!(self, TransportError::PermanentRejection(_))
	}
}

/// The realtime push/subscribe channel keyed by identity.
///
/// Delivery is at-least-once and may reorder records, including records
/// of the same owner.
#[async_trait]
pub trait SyncTransport: Send + Sync + 'static {
	/// Write one of this identity's records to the remote store.
	async fn push(&self, record: &LocationRecord) -> Result<(), TransportError>;

	/// Stream records of `peers` as they change. Implementations may
	/// replay current state first.
	async fn subscribe(&self, peers: &BTreeSet<OwnerId>) -> Result<RecordStream, TransportError>;

	fn connectivity(&self) -> Connectivity;

	/// Connectivity changes; the current value is available immediately.
	fn watch_connectivity(&self) -> watch::Receiver<Connectivity>;
}
