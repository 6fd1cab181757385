use thiserror::Error;

use crate::store::StoreError;
use crate::sync::TransportError;

/// Errors surfaced to callers of a `PresenceSession`.
#[derive(Debug, Error)]
pub enum PresenceError {
	#[error("invalid location sample: {0}")]
	InvalidLocation(String),

	/// The remote store refused this identity; re-authenticate and call
	/// `resume_after_reauth` before resuming.
	#[error("rejected by remote store: {0}")]
	PermanentRejection(String),

	#[error("transport error: {0}")]
	Transport(TransportError),

	#[error("storage error: {0}")]
	Storage(#[from] StoreError),

	#[error("metrics error: {0}")]
	Metrics(#[from] prometheus::Error),

	#[error("session has been shut down")]
	Closed,
}

impl From<TransportError> for PresenceError {
	fn from(e: TransportError) -> Self {
		match e {
			TransportError::PermanentRejection(reason) => PresenceError::PermanentRejection(reason),
			other => PresenceError::Transport(other),
		}
	}
}

pub type Result<T, E = PresenceError> = std::result::Result<T, E>;
