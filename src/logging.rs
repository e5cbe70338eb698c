use fern::colors::ColoredLevelConfig;
use log::LevelFilter;

/// Initialize stdout logging for hosts that embed the agent without their
/// own logging setup. Call at most once per process; embedding hosts with
/// an existing `log` backend should skip this entirely.
pub fn init_logging(level: LevelFilter) -> Result<(), fern::InitError> {
	let colors = ColoredLevelConfig::new();
	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} [{}] [{}] {}",
				chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level)
		.chain(std::io::stdout())
		.apply()?;
	Ok(())
}
