use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use tracing_subscriber::EnvFilter;

use crate::LoggingConfig;

/// Install the fmt subscriber; `RUST_LOG` wins over the configured filter
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| eyre!("Invalid log filter {:?}: {}", config.filter, e))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .try_init()
        .map_err(|e| eyre!(e))
}

/// Time between frames at `frame_rate`, zero rate counts as one
pub fn frame_interval_us(frame_rate: u32) -> i64 {
    1_000_000 / i64::from(frame_rate.max(1))
}

pub fn frame_interval(frame_rate: u32) -> Duration {
    Duration::from_micros(frame_interval_us(frame_rate) as u64)
}

/// Render microseconds as seconds with millisecond precision
pub fn format_us(us: i64) -> String {
    format!("{:.3}s", us as f64 / 1_000_000.0)
}
