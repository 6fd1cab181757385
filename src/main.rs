use std::time::Duration;

use anyhow::Context;
use beacon_presence::config;
use beacon_presence::observability::init_logging;
use beacon_presence::simulate::{SimulationOptions, run_simulation};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon", about = "Beacon - offline-first location sharing")]
struct Cli {
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run several in-process sessions against a simulated realtime store
	Simulate {
		/// Number of simulated users
		#[arg(long, default_value_t = 3)]
		users: usize,
		/// Location samples reported by each user
		#[arg(long, default_value_t = 5)]
		samples: usize,
		/// Take the realtime store offline halfway through
		#[arg(long)]
		outage: bool,
		/// Persist each user's state under the configured data dir
		#[arg(long)]
		persist: bool,
		/// Scheduler tick in milliseconds
		#[arg(long, default_value_t = 50)]
		tick_ms: u64,
		/// Seconds to wait for all users to converge
		#[arg(long, default_value_t = 30)]
		timeout: u64,
	},
	/// Print the effective settings as JSON
	Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	let settings = config::load().context("failed to load configuration")?;

	match cli.command.unwrap_or(Commands::Config) {
		Commands::Simulate {
			users,
			samples,
			outage,
			persist,
			tick_ms,
			timeout,
		} => {
			init_logging(settings.log_level.to_level_filter())
				.context("failed to initialize logging")?;

			let opts = SimulationOptions {
				users,
				samples,
				outage,
				persist,
				tick: Duration::from_millis(tick_ms),
				timeout: Duration::from_secs(timeout),
			};
			let report = run_simulation(&settings, &opts).await?;
			println!("{}", serde_json::to_string_pretty(&report)?);
			if !report.converged {
				anyhow::bail!("sessions did not converge within {}s", timeout);
			}
		}
		Commands::Config => {
			println!("{}", serde_json::to_string_pretty(&settings)?);
		}
	}
	Ok(())
}
