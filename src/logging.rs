use eyre::{Result, WrapErr};
use log::LevelFilter;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Pick the log level: `RUST_LOG` wins, then `--verbose`, then info.
pub fn resolve_level(env_level: Option<&str>, verbose: bool) -> LevelFilter {
    if let Some(level) = env_level.and_then(|l| l.parse::<LevelFilter>().ok()) {
        return level;
    }
    if verbose { LevelFilter::Debug } else { LevelFilter::Info }
}

/// Initialize logging to stderr, or appended to `log_file` when given
pub fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let env_level = std::env::var("RUST_LOG").ok();
    let log_level = resolve_level(env_level.as_deref(), verbose);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level).format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {} - {}",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        )
    });

    if let Some(path) = log_file {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .wrap_err_with(|| format!("Failed to create log directory {}", parent.display()))?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .wrap_err_with(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }

    builder.try_init().wrap_err("Logger already initialized")?;

    log::debug!("[logging] initialized: level={} file={:?}", log_level, log_file);
    Ok(())
}
