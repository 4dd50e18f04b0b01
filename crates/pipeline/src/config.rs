// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

/// Flush interval clamp bounds (§adaptive flush). Readings-per-second can
/// swing two orders of magnitude between idle and highway driving; the
/// interval never leaves this window.
pub const MIN_FLUSH_INTERVAL_MS: u64 = 50;
pub const MAX_FLUSH_INTERVAL_MS: u64 = 1000;

/// Configuration for the sensor streaming pipeline.
///
/// All knobs resolve from the environment so the embedding app can configure
/// the pipeline without code changes.
#[derive(Debug, Clone, clap::Args)]
pub struct StreamConfig {
    /// Feature toggle; case-insensitive "true" enables streaming.
    #[arg(long, env = "SENSOR_STREAMING_ENABLED", default_value = "false")]
    pub streaming_enabled: String,

    /// Accelerometer/gyroscope sample rate in Hz.
    #[arg(long, env = "SENSOR_RATE_HZ", default_value_t = 50)]
    pub sample_rate_hz: u32,

    /// Initial flush interval hint in milliseconds; the adaptive loop takes
    /// over from there. Clamped into [50, 1000].
    #[arg(long, env = "SENSOR_BATCH_MS", default_value_t = 200)]
    pub batch_ms: u64,

    /// Days to retain acked queue rows before maintenance purges them.
    #[arg(long, env = "SENSOR_SQLITE_RETENTION_DAYS", default_value_t = 3)]
    pub retention_days: u32,

    /// Directory holding the queue database and the device keystore.
    #[arg(long, env = "SENSOR_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// ClickHouse HTTP endpoint, e.g. `https://ch.example.com:8443`.
    #[arg(long, env = "CLICKHOUSE_URL")]
    pub clickhouse_url: Option<String>,

    /// ClickHouse user for HTTP Basic auth.
    #[arg(long, env = "CLICKHOUSE_USER", default_value = "default")]
    pub clickhouse_user: String,

    /// ClickHouse password for HTTP Basic auth.
    #[arg(long, env = "CLICKHOUSE_PASSWORD", default_value = "")]
    pub clickhouse_password: String,
}

impl StreamConfig {
    /// Whether the feature toggle enables streaming.
    pub fn streaming_enabled(&self) -> bool {
        self.streaming_enabled.eq_ignore_ascii_case("true")
    }

    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.sample_rate_hz == 0 {
            anyhow::bail!("--sample-rate-hz must be at least 1");
        }
        if self.streaming_enabled() && self.clickhouse_url.is_none() {
            anyhow::bail!("CLICKHOUSE_URL must be set when streaming is enabled");
        }
        Ok(())
    }

    /// Initial flush interval, clamped into the adaptive window.
    pub fn initial_flush_interval(&self) -> Duration {
        Duration::from_millis(self.batch_ms.clamp(MIN_FLUSH_INTERVAL_MS, MAX_FLUSH_INTERVAL_MS))
    }

    /// Motion (accel/gyro) update interval for the requested sample rate,
    /// clamped to the 10 ms floor the OS sensor stack honors.
    pub fn motion_update_interval(&self) -> Duration {
        let ms = (1000 / u64::from(self.sample_rate_hz.max(1))).max(10);
        Duration::from_millis(ms)
    }

    /// Acked-row retention for queue maintenance.
    pub fn acked_retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 3600)
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("sensor_queue.db")
    }

    pub fn keystore_path(&self) -> PathBuf {
        self.data_dir.join("keystore.json")
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
