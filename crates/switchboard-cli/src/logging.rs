use std::path::PathBuf;

use anyhow::{Context, Result};
use etcetera::{choose_app_strategy, AppStrategy};
use switchboard::APP_STRATEGY;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str =
    "switchboard=info,switchboard_cli=info,mcp_client=info,mcp_server=info";

/// `logs/` under the platform state directory, falling back to the data
/// directory where there is no state directory.
pub fn log_dir() -> Result<PathBuf> {
    let strategy =
        choose_app_strategy(APP_STRATEGY.clone()).context("Failed to find a home directory")?;
    let dir = strategy
        .in_state_dir("logs")
        .unwrap_or_else(|| strategy.in_data_dir("logs"));
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    Ok(dir)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Log to a daily rolling file named after `name`, and warnings to stderr.
/// Stdout carries the protocol and is never written to.
///
/// Keep the returned guard alive for as long as logs should be flushed.
pub fn setup_logging(name: &str) -> Result<WorkerGuard> {
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(name)
        .filename_suffix("log")
        .build(log_dir()?)
        .context("Failed to create log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .json();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(LevelFilter::WARN);

    Registry::default()
        .with(env_filter())
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .context("Failed to set global subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filter_parses() {
        let filter = EnvFilter::try_new(DEFAULT_FILTER).unwrap();
        assert!(filter.to_string().contains("switchboard=info"));
    }
}
