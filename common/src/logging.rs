use std::path::Path;

use anyhow::{anyhow, Result};
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;

/// Logging bootstrap options, derived from [`crate::config::Config`].
pub struct LogConfig<'a> {
    pub level: LevelFilter,
    pub json: bool,
    pub disable_file_logging: bool,
    pub logs_path: &'a str,
    pub filename_log: &'a str,
}

/// Install the global fern dispatcher. Call once per process, before any
/// component logs.
pub fn init(config: LogConfig<'_>) -> Result<()> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Cyan)
        .trace(Color::BrightBlack);

    let mut dispatch = fern::Dispatch::new().level(config.level);

    let stdout = if config.json {
        fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{}",
                    serde_json::json!({
                        "ts": chrono::Utc::now().to_rfc3339(),
                        "level": record.level().to_string(),
                        "target": record.target(),
                        "msg": message.to_string(),
                    })
                ))
            })
            .chain(std::io::stdout())
    } else {
        fern::Dispatch::new()
            .format(move |out, message, record| {
                out.finish(format_args!(
                    "{} | {:<5} | {} - {}",
                    chrono::Local::now().format("%H:%M:%S"),
                    colors.color(record.level()),
                    record.target(),
                    message
                ))
            })
            .chain(std::io::stdout())
    };
    dispatch = dispatch.chain(stdout);

    if !config.disable_file_logging {
        std::fs::create_dir_all(config.logs_path)
            .map_err(|e| anyhow!("Failed to create logs directory '{}': {}", config.logs_path, e))?;
        let path = Path::new(config.logs_path).join(config.filename_log);
        let file = fern::Dispatch::new()
            .format(|out, message, record| {
                out.finish(format_args!(
                    "{} | {:<5} | {} - {}",
                    chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.target(),
                    message
                ))
            })
            .chain(fern::log_file(&path).map_err(|e| {
                anyhow!("Failed to open log file '{}': {}", path.display(), e)
            })?);
        dispatch = dispatch.chain(file);
    }

    dispatch
        .apply()
        .map_err(|e| anyhow!("Logger already initialized: {}", e))?;
    Ok(())
}
