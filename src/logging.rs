//! Tracing subscriber setup.
//!
//! Filter directives are resolved in priority order `TASKH_LOG` >
//! `RUST_LOG` > `[logging].level`. An unparseable variable falls through
//! to the next source rather than failing startup. Logs go to stderr so
//! that command output on stdout stays machine-readable.

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

const TASKH_LOG: &str = "TASKH_LOG";

pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = build_env_filter(
        std::env::var(TASKH_LOG).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        &config.level,
    );
    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.format.as_str() {
        "json" => subscriber
            .json()
            .try_init()
            .map_err(|err| anyhow!("failed to init tracing: {err}")),
        _ => subscriber
            .try_init()
            .map_err(|err| anyhow!("failed to init tracing: {err}")),
    }
}

fn build_env_filter(taskh_log: Option<&str>, rust_log: Option<&str>, level: &str) -> EnvFilter {
    for directives in [taskh_log, rust_log].into_iter().flatten() {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
    }
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}
