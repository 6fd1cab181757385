//! Common test utilities and helpers for integration tests.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;

use beacon_presence::{
	HybridTimestamp, KeyValueStore, LocationRecord, MemoryHub, MemoryStore, OwnerId,
	PresenceEvent, PresenceSession, Settings,
};
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant, sleep, timeout};

/// Default time allowed for background work to settle.
pub const SETTLE: Duration = Duration::from_secs(5);

/// Settings with short timers so sessions react within milliseconds.
pub fn fast_settings() -> Settings {
	Settings {
		tick_interval_ms: 10,
		min_sync_interval_ms: 0,
		backoff_initial_ms: 10,
		backoff_max_ms: 100,
		backoff_jitter_percent: 0,
		..Settings::default()
	}
}

pub fn owner(id: &str) -> OwnerId {
	OwnerId::new(id)
}

/// A record as another client would publish it.
pub fn record(id: &str, sequence: u64, wall_ms: i64) -> LocationRecord {
	LocationRecord::new(
		owner(id),
		sequence,
		HybridTimestamp::new(wall_ms, 0),
		48.85 + sequence as f64 * 0.001,
		2.35,
		10.0,
	)
}

/// Open a session on `hub` backed by a fresh in-memory store.
pub async fn open_session(hub: &MemoryHub, id: &str, settings: &Settings) -> PresenceSession {
	let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
	open_session_with(hub, id, settings, kv).await
}

pub async fn open_session_with(
	hub: &MemoryHub,
	id: &str,
	settings: &Settings,
	kv: Arc<dyn KeyValueStore>,
) -> PresenceSession {
	PresenceSession::open(owner(id), settings, Arc::new(hub.transport(owner(id))), kv)
		.await
		.expect("open session")
}

/// Poll `check` until it holds or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
	F: FnMut() -> Fut,
	Fut: Future<Output = bool>,
{
	let deadline = Instant::now() + within;
	loop {
		if check().await {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		sleep(Duration::from_millis(10)).await;
	}
}

/// Next event matching `pred`, skipping others.
pub async fn wait_for_event<F>(
	events: &mut broadcast::Receiver<PresenceEvent>,
	within: Duration,
	pred: F,
) -> Option<PresenceEvent>
where
	F: Fn(&PresenceEvent) -> bool,
{
	timeout(within, async {
		loop {
			match events.recv().await {
				Ok(event) if pred(&event) => return Some(event),
				Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
				Err(broadcast::error::RecvError::Closed) => return None,
			}
		}
	})
	.await
	.ok()
	.flatten()
}
