//! Logging setup using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. the `level` argument (usually `EngineConfig::log_level`)
//! 2. the `DEPLOYGRAPH_LOG` environment variable
//! 3. default to `info`
//!
//! Logs go to STDERR.

use anyhow::{Result, anyhow};
use tracing_subscriber::fmt;

pub const LOG_ENV: &str = "DEPLOYGRAPH_LOG";

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(level: Option<&str>) -> Result<()> {
    let level = level
        .and_then(parse_level_str)
        .or_else(|| std::env::var(LOG_ENV).ok().and_then(|s| parse_level_str(&s)))
        .unwrap_or(tracing::Level::INFO);

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow!("installing tracing subscriber: {e}"))
}

pub fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}
