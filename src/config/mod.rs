use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use log::Level;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::{BackoffPolicy, QueuePolicy, SchedulePolicy, TieBreak};

const ENV_PREFIX: &str = "BCN";

/// Runtime configuration for a presence session.
///
/// Values are loaded from (in order): `/etc/beacon/beacon.json`, the user
/// config folder and the local config folder (both optional), then
/// environment variables prefixed with `BCN_` (e.g. `BCN_MAX_ATTEMPTS`).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(default)]
pub struct Settings {
	/// Where `FileStore` keeps records and the outbound queue.
	pub data_dir: PathBuf,
	pub log_level: Level,
	/// Period of the worker's scheduler tick.
	pub tick_interval_ms: u64,
	pub min_sync_interval_ms: u64,
	pub max_staleness_secs: u64,
	pub backoff_initial_ms: u64,
	pub backoff_max_ms: u64,
	pub backoff_jitter_percent: u32,
	pub max_attempts: u32,
	/// 0 keeps pending updates until delivered or exhausted.
	pub pending_ttl_secs: u64,
	pub queue_capacity: usize,
	pub tie_break: TieBreak,
}

impl Default for Settings {
	fn default() -> Self {
		let data_dir = dirs::data_local_dir()
			.map(|d| d.join("beacon"))
			.unwrap_or_else(|| PathBuf::from("beacon-data"));

		Self {
			data_dir,
			log_level: Level::Info,
			tick_interval_ms: 1_000,
			min_sync_interval_ms: 5_000,
			max_staleness_secs: 15 * 60,
			backoff_initial_ms: 1_000,
			backoff_max_ms: 5 * 60 * 1_000,
			backoff_jitter_percent: 25,
			max_attempts: 8,
			pending_ttl_secs: 0,
			queue_capacity: 256,
			tie_break: TieBreak::WallClock,
		}
	}
}

/// Typed policies derived from `Settings`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
	pub tick_interval: Duration,
	pub tie_break: TieBreak,
	pub queue: QueuePolicy,
	pub schedule: SchedulePolicy,
}

impl Settings {
	pub fn validate(&self) -> Result<(), SettingsError> {
		if self.tick_interval_ms == 0 {
			return Err(SettingsError::Invalid("tick_interval_ms must be positive".into()));
		}
		if self.max_attempts == 0 {
			return Err(SettingsError::Invalid("max_attempts must be positive".into()));
		}
		if self.queue_capacity == 0 {
			return Err(SettingsError::Invalid("queue_capacity must be positive".into()));
		}
		if self.backoff_initial_ms > self.backoff_max_ms {
			return Err(SettingsError::Invalid(format!(
				"backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
				self.backoff_initial_ms, self.backoff_max_ms
			)));
		}
		Ok(())
	}

	pub fn sync_policy(&self) -> SyncPolicy {
		let backoff = BackoffPolicy {
			initial: Duration::from_millis(self.backoff_initial_ms),
			max: Duration::from_millis(self.backoff_max_ms),
			jitter_percent: self.backoff_jitter_percent,
		};
		let ttl = (self.pending_ttl_secs > 0).then(|| Duration::from_secs(self.pending_ttl_secs));

		SyncPolicy {
			tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
			tie_break: self.tie_break,
			queue: QueuePolicy {
				capacity: self.queue_capacity,
				max_attempts: self.max_attempts,
				ttl,
				backoff: backoff.clone(),
			},
			schedule: SchedulePolicy {
				min_interval: Duration::from_millis(self.min_sync_interval_ms),
				max_staleness: Duration::from_secs(self.max_staleness_secs),
				backoff,
			},
		}
	}
}

#[derive(Debug, Error)]
pub enum SettingsError {
	#[error("configuration error: {0}")]
	Config(#[from] config::ConfigError),

	#[error("invalid configuration: {0}")]
	Invalid(String),
}

/// Apply `BCN_<name>` when it is set, non-empty and parses.
fn env_override<T: FromStr>(name: &str, target: &mut T) {
	let Ok(raw) = std::env::var(format!("{}_{}", ENV_PREFIX, name)) else {
		return;
	};
	if raw.is_empty() {
		return;
	}
	match raw.parse::<T>() {
		Ok(parsed) => *target = parsed,
		Err(_) => log::warn!("Ignoring unparsable {}_{}={}", ENV_PREFIX, name, raw),
	}
}

pub fn load() -> Result<Settings, SettingsError> {
	let mut builder = config::Config::builder()
		.add_source(config::File::with_name("/etc/beacon/beacon.json").required(false));

	if let Some(folder) = dirs::config_dir() {
		let user_config_path = folder.join("beacon").join("beacon.json");
		builder = builder.add_source(config::File::from(user_config_path).required(false));
	}
	if let Some(folder) = dirs::config_local_dir() {
		let local_config_path = folder.join("beacon").join("beacon.json");
		builder = builder.add_source(config::File::from(local_config_path).required(false));
	}

	builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"));

	let cfg = builder.build()?;
	let mut s: Settings = cfg.try_deserialize()?;

	// Direct variables win over whatever the `config` crate mapped.
	env_override("DATA_DIR", &mut s.data_dir);
	env_override("LOG_LEVEL", &mut s.log_level);
	env_override("TICK_INTERVAL_MS", &mut s.tick_interval_ms);
	env_override("MIN_SYNC_INTERVAL_MS", &mut s.min_sync_interval_ms);
	env_override("MAX_STALENESS_SECS", &mut s.max_staleness_secs);
	env_override("BACKOFF_INITIAL_MS", &mut s.backoff_initial_ms);
	env_override("BACKOFF_MAX_MS", &mut s.backoff_max_ms);
	env_override("BACKOFF_JITTER_PERCENT", &mut s.backoff_jitter_percent);
	env_override("MAX_ATTEMPTS", &mut s.max_attempts);
	env_override("PENDING_TTL_SECS", &mut s.pending_ttl_secs);
	env_override("QUEUE_CAPACITY", &mut s.queue_capacity);
	env_override("TIE_BREAK", &mut s.tie_break);

	s.validate()?;
	Ok(s)
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	use std::env;

	use log::Level;

	use crate::config::{Settings, SettingsError, load};
	use crate::sync::TieBreak;

	const VARS: [&str; 4] = [
		"BCN_LOG_LEVEL",
		"BCN_MAX_ATTEMPTS",
		"BCN_PENDING_TTL_SECS",
		"BCN_TIE_BREAK",
	];

	#[test]
	fn test_load_defaults_and_env_overlay() {
		// Save original values so we can restore them
		let originals: Vec<_> = VARS.iter().map(|v| env::var_os(v)).collect();
		for v in VARS {
			unsafe { env::remove_var(v) };
		}

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.log_level, d.log_level);
		assert_eq!(s.max_attempts, d.max_attempts);
		assert_eq!(s.tie_break, TieBreak::WallClock);

		unsafe { env::set_var("BCN_LOG_LEVEL", "debug") };
		unsafe { env::set_var("BCN_MAX_ATTEMPTS", "3") };
		unsafe { env::set_var("BCN_PENDING_TTL_SECS", "600") };
		unsafe { env::set_var("BCN_TIE_BREAK", "prefer_stored") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.log_level, Level::Debug);
		assert_eq!(s2.max_attempts, 3);
		assert_eq!(s2.pending_ttl_secs, 600);
		assert_eq!(s2.tie_break, TieBreak::PreferStored);

		for (v, orig) in VARS.iter().zip(originals) {
			match orig {
				Some(val) => unsafe { env::set_var(v, val) },
				None => unsafe { env::remove_var(v) },
			}
		}
	}

	#[test]
	fn sync_policy_maps_fields() {
		let s = Settings {
			pending_ttl_secs: 0,
			backoff_initial_ms: 250,
			max_attempts: 4,
			..Settings::default()
		};
		let p = s.sync_policy();
		assert_eq!(p.queue.ttl, None);
		assert_eq!(p.queue.max_attempts, 4);
		assert_eq!(p.queue.backoff.initial.as_millis(), 250);
		assert_eq!(p.schedule.backoff, p.queue.backoff);

		let with_ttl = Settings {
			pending_ttl_secs: 30,
			..Settings::default()
		};
		assert_eq!(
			with_ttl.sync_policy().queue.ttl.map(|d| d.as_secs()),
			Some(30)
		);
	}

	#[test]
	fn validate_rejects_nonsense() {
		let s = Settings {
			queue_capacity: 0,
			..Settings::default()
		};
		assert!(matches!(s.validate(), Err(SettingsError::Invalid(_))));

		let s = Settings {
			backoff_initial_ms: 10_000,
			backoff_max_ms: 1_000,
			..Settings::default()
		};
		assert!(s.validate().is_err());
		assert!(Settings::default().validate().is_ok());
	}
}
