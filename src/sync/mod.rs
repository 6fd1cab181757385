pub mod backoff;
pub mod memory;
pub mod merge;
pub mod queue;
pub mod schedule;
pub mod subscription;
pub mod transport;
pub mod worker;

pub use backoff::BackoffPolicy;
pub use memory::{MemoryHub, MemoryTransport};
pub use merge::{MergeResult, ReconciliationEngine, ReconciliationState, TieBreak, resolve};
pub use queue::{
	ChangeQueue, DeliveryFailure, DroppedUpdate, EnqueueOutcome, FailOutcome, QueuePolicy,
};
pub use schedule::{Decision, ScheduleController, ScheduleEvent, SchedulePolicy, ScheduleState};
pub use transport::{RecordStream, SyncTransport, TransportError};
pub use worker::RunError;
