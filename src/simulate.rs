use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use serde::Serialize;
use tokio::time::{Instant, sleep};

use crate::config::Settings;
use crate::error::Result;
use crate::model::{Connectivity, LocationRecord, OwnerId};
use crate::session::PresenceSession;
use crate::store::{FileStore, KeyValueStore, MemoryStore};
use crate::sync::MemoryHub;

/// Parameters for an in-process simulation.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
	pub users: usize,
	pub samples: usize,
	/// Take the hub offline for the middle of the run.
	pub outage: bool,
	/// Keep each user's state in a `FileStore` under the data dir.
	pub persist: bool,
	pub tick: Duration,
	/// Give up waiting for convergence after this long.
	pub timeout: Duration,
}

impl Default for SimulationOptions {
	fn default() -> Self {
		Self {
			users: 3,
			samples: 5,
			outage: false,
			persist: false,
			tick: Duration::from_millis(50),
			timeout: Duration::from_secs(30),
		}
	}
}

/// What every simulated user sees at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
	pub converged: bool,
	pub elapsed_ms: u128,
	pub views: HashMap<OwnerId, HashMap<OwnerId, LocationRecord>>,
}

fn random_step(from: (f64, f64)) -> (f64, f64) {
	let mut rng = rand::thread_rng();
	let lat = (from.0 + rng.gen_range(-0.001..=0.001)).clamp(-90.0, 90.0);
	let lon = (from.1 + rng.gen_range(-0.001..=0.001)).clamp(-180.0, 180.0);
	(lat, lon)
}

async fn converged(hub: &MemoryHub, sessions: &[PresenceSession]) -> bool {
	for session in sessions {
		let view = session.current_locations().await;
		for other in sessions {
			let expected = hub.record(other.identity()).await;
			if expected.is_none() || view.get(other.identity()) != expected.as_ref() {
				return false;
			}
		}
	}
	true
}

/// Run several sessions that follow each other through a `MemoryHub` and
/// wait until every session sees every other user's latest location.
pub async fn run_simulation(settings: &Settings, opts: &SimulationOptions) -> Result<SimulationReport> {
	let settings = Settings {
		tick_interval_ms: opts.tick.as_millis().max(1) as u64,
		min_sync_interval_ms: 0,
		..settings.clone()
	};
	let hub = MemoryHub::new();
	let ids: Vec<OwnerId> = (0..opts.users)
		.map(|i| OwnerId::new(format!("user-{}", i)))
		.collect();

	let mut sessions = Vec::with_capacity(ids.len());
	for id in &ids {
		let kv: Arc<dyn KeyValueStore> = if opts.persist {
			Arc::new(FileStore::open(settings.data_dir.join(id.as_str())).await?)
		} else {
			Arc::new(MemoryStore::new())
		};
		let session =
			PresenceSession::open(id.clone(), &settings, Arc::new(hub.transport(id.clone())), kv)
				.await?;
		session
			.start(ids.iter().filter(|p| *p != id).cloned())
			.await?;
		sessions.push(session);
	}

	let started = Instant::now();
	let mut positions: Vec<(f64, f64)> = (0..ids.len())
		.map(|i| (52.52 + i as f64 * 0.01, 13.40))
		.collect();

	for round in 0..opts.samples {
		if opts.outage && round == opts.samples / 2 {
			info!("Simulating outage");
			hub.set_connectivity(Connectivity::Offline).await;
		}
		for (session, position) in sessions.iter().zip(positions.iter_mut()) {
			*position = random_step(*position);
			session.report_location(position.0, position.1, 5.0).await?;
		}
		sleep(opts.tick).await;
	}
	if opts.outage {
		info!("Outage over");
		hub.set_connectivity(Connectivity::Online).await;
	}

	let deadline = started + opts.timeout;
	let mut done = converged(&hub, &sessions).await;
	while !done && Instant::now() < deadline {
		for session in &sessions {
			session.background_sync().await?;
		}
		sleep(opts.tick).await;
		done = converged(&hub, &sessions).await;
	}
	if !done {
		warn!("Sessions did not converge within {:?}", opts.timeout);
	}

	let mut views = HashMap::new();
	for session in &sessions {
		views.insert(session.identity().clone(), session.current_locations().await);
		session.shutdown().await;
	}

	Ok(SimulationReport {
		converged: done,
		elapsed_ms: started.elapsed().as_millis(),
		views,
	})
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[tokio::test]
	async fn sessions_converge_through_an_outage() {
		let opts = SimulationOptions {
			users: 3,
			samples: 4,
			outage: true,
			tick: Duration::from_millis(10),
			..SimulationOptions::default()
		};
		let settings = Settings {
			backoff_initial_ms: 10,
			backoff_max_ms: 100,
			..Settings::default()
		};

		let report = run_simulation(&settings, &opts).await.unwrap();
		assert!(report.converged);
		assert_eq!(report.views.len(), 3);
		for view in report.views.values() {
			assert_eq!(view.len(), 3);
		}
	}
}
