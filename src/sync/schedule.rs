use std::time::Duration;

use log::{debug, info};
use tokio::time::Instant;

use super::backoff::BackoffPolicy;
use crate::model::Connectivity;

/// Cadence limits for background synchronization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulePolicy {
	/// Minimum time between the starts of two runs.
	pub min_interval: Duration,
	/// A run is forced when no sync succeeded for this long while presence
	/// tracking is active, even with nothing queued.
	pub max_staleness: Duration,
	/// Delay after consecutive failed runs.
	pub backoff: BackoffPolicy,
}

impl Default for SchedulePolicy {
	fn default() -> Self {
		Self {
			min_interval: Duration::from_secs(5),
			max_staleness: Duration::from_secs(15 * 60),
			backoff: BackoffPolicy::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
	Idle,
	Scheduled,
	Running,
	Backoff { until: Instant },
}

/// Discrete inputs to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleEvent {
	/// Periodic timer, or a late/batched invocation by the OS scheduler.
	Tick,
	/// Something changed locally (e.g. a new sample was queued).
	Trigger,
	ConnectivityChanged(Connectivity),
	RunSucceeded,
	RunFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
	Wait,
	/// Start a sync run now and report its result back.
	Run,
}

/// Decides when a sync run happens.
///
/// Holds no timers of its own: every event carries `now`, so delayed or
/// skipped invocations only postpone decisions.
#[derive(Debug)]
pub struct ScheduleController {
	policy: SchedulePolicy,
	state: ScheduleState,
	connectivity: Connectivity,
	consecutive_failures: u32,
	last_run_started: Option<Instant>,
	last_success: Option<Instant>,
	presence_active: bool,
}

impl ScheduleController {
	pub fn new(policy: SchedulePolicy, connectivity: Connectivity) -> Self {
		Self {
			policy,
			state: ScheduleState::Idle,
			connectivity,
			consecutive_failures: 0,
			last_run_started: None,
			last_success: None,
			presence_active: false,
		}
	}

	pub fn state(&self) -> ScheduleState {
		self.state
	}

	pub fn connectivity(&self) -> Connectivity {
		self.connectivity
	}

	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}

	pub fn last_success(&self) -> Option<Instant> {
		self.last_success
	}

	/// While inactive, subscription refreshes are never due; queued updates
	/// still drain.
	pub fn set_presence_active(&mut self, active: bool) {
		self.presence_active = active;
	}

	/// Feed one event. `queue_ready` tells whether an outbound update is
	/// waiting to be sent.
	pub fn handle(&mut self, event: ScheduleEvent, now: Instant, queue_ready: bool) -> Decision {
		match event {
			ScheduleEvent::ConnectivityChanged(state) => {
				if state != self.connectivity {
					debug!("Scheduler connectivity {} -> {}", self.connectivity, state);
				}
				self.connectivity = state;
			}
			ScheduleEvent::Tick | ScheduleEvent::Trigger => match self.state {
				ScheduleState::Idle => self.state = ScheduleState::Scheduled,
				ScheduleState::Backoff { until } if event == ScheduleEvent::Tick && now >= until => {
					debug!("Backoff elapsed, rescheduling");
					self.state = ScheduleState::Scheduled;
				}
				_ => {}
			},
			ScheduleEvent::RunSucceeded => {
				if self.state == ScheduleState::Running {
					self.state = ScheduleState::Idle;
					self.consecutive_failures = 0;
					self.last_success = Some(now);
				}
			}
			ScheduleEvent::RunFailed => {
				if self.state == ScheduleState::Running {
					self.consecutive_failures += 1;
					let delay = self.policy.backoff.delay(self.consecutive_failures);
					info!(
						"Sync run failed ({} in a row), backing off for {:?}",
						self.consecutive_failures, delay
					);
					self.state = ScheduleState::Backoff { until: now + delay };
				}
			}
		}

		if self.state == ScheduleState::Scheduled {
			self.evaluate(now, queue_ready)
		} else {
			Decision::Wait
		}
	}

	fn refresh_due(&self, now: Instant) -> bool {
		self.presence_active
			&& self
				.last_success
				.is_none_or(|t| now.saturating_duration_since(t) >= self.policy.max_staleness)
	}

	fn evaluate(&mut self, now: Instant, queue_ready: bool) -> Decision {
		if !queue_ready && !self.refresh_due(now) {
			self.state = ScheduleState::Idle;
			return Decision::Wait;
		}
		if !self.connectivity.is_online() {
			return Decision::Wait;
		}
		if let Some(last) = self.last_run_started {
			if now.saturating_duration_since(last) < self.policy.min_interval {
				return Decision::Wait;
			}
		}

		self.state = ScheduleState::Running;
		self.last_run_started = Some(now);
		Decision::Run
	}
}
