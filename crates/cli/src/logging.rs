//! Log setup for the spmigrate CLI
//!
//! Console output goes to stderr so it never mixes with command output. When
//! a log directory is configured, every run also writes `upload_<timestamp>.log`
//! through a non-blocking appender.

use anyhow::{Context, Result};
use spmigrate_core::LoggingConfig;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Keeps the file writer alive; dropping it flushes pending lines
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Console level: the configured level, raised one step per `-v` flag
fn console_level(configured: &str, verbose: u8) -> String {
    let base = LEVELS
        .iter()
        .position(|level| level.eq_ignore_ascii_case(configured.trim()));
    match base {
        Some(base) => LEVELS[(base + verbose as usize).min(LEVELS.len() - 1)].to_string(),
        // a full filter directive is taken as written unless -v asks for more
        None if verbose == 0 => configured.to_string(),
        None => LEVELS[(1 + verbose as usize).min(LEVELS.len() - 1)].to_string(),
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the console level.
pub fn init_logging(config: &LoggingConfig, verbose: u8) -> Result<LogGuard> {
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(console_level(&config.level, verbose)));

    let console_layer = match config.format.as_str() {
        "compact" => fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed(),
        _ => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed(),
    };

    let (file_layer, file_guard) = match &config.file {
        Some(dir) => {
            let (writer, guard) = file_writer(Path::new(dir))?;
            let layer = fmt::layer()
                .with_target(true)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new(&config.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install log subscriber")?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

fn file_writer(dir: &Path) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let file_name = format!("upload_{}.log", chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Ok(tracing_appender::non_blocking(appender))
}
