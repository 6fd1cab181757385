use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Install the process-wide logger writing colored lines to stderr.
///
/// Fails if a logger was already installed.
pub fn init_logging(level: LevelFilter) -> Result<(), log::SetLoggerError> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Blue)
		.trace(Color::BrightBlack);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:<5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level)
		.chain(std::io::stderr())
		.apply()
}

#[cfg(test)]
#[cfg(feature = "unit-tests")]
mod tests {
	#[test]
	fn second_initialization_fails() {
		// Only one logger can be installed per process; whichever call runs
		// second must report it.
		let first = super::init_logging(log::LevelFilter::Warn);
		let second = super::init_logging(log::LevelFilter::Warn);
		assert!(first.is_err() || second.is_err());
	}
}
