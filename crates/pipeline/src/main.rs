// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Soak harness: runs the full pipeline against a simulated drive and logs
//! the throughput snapshot, for load testing against a real ClickHouse.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use roadsense::config::StreamConfig;
use roadsense::coordinator::{NoVehicles, SessionState, StreamCoordinator};
use roadsense::identity::AlwaysGrant;
use roadsense::sensors::{SensorPlatform, SimulatedPlatform};

#[derive(Parser)]
#[command(name = "roadsense", version, about = "Sensor streaming soak harness.")]
struct Cli {
    #[command(flatten)]
    config: StreamConfig,

    /// How long to run the simulated drive, in seconds.
    #[arg(long, default_value_t = 60)]
    duration_secs: u64,

    /// Driver id to stamp on batches.
    #[arg(long, default_value = "soak-driver")]
    driver_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // TLS provider for reqwest's rustls-no-provider build.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    cli.config.validate()?;
    if !cli.config.streaming_enabled() {
        anyhow::bail!("set SENSOR_STREAMING_ENABLED=true to run the harness");
    }

    let platform = SimulatedPlatform::new();
    let session = SessionState::new();
    session.set_authenticated(true);
    session.set_navigating(true);
    session.set_driver_id(Some(cli.driver_id.clone()));

    let coordinator = StreamCoordinator::new(
        cli.config,
        Arc::clone(&platform) as Arc<dyn SensorPlatform>,
        Arc::new(AlwaysGrant),
        session,
        Arc::new(NoVehicles),
    );
    coordinator.permission_gate().request();
    coordinator.start().await?;
    tracing::info!(duration_secs = cli.duration_secs, "simulated drive started");

    let registry = coordinator.registry();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(cli.duration_secs);
    let mut report = tokio::time::interval(Duration::from_secs(5));
    report.tick().await;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            _ = report.tick() => {
                let snap = registry.observe();
                tracing::info!(
                    status = snap.status.as_str(),
                    readings_per_sec = snap.rates.readings_per_sec,
                    batches_sent = snap.total_batches_sent,
                    batches_failed = snap.total_batches_failed,
                    queue_depth = snap.queue_depth,
                    avg_latency_ms = snap.latency.map(|l| l.avg_ms).unwrap_or(0.0),
                    "throughput",
                );
            }
        }
    }

    // Snapshot before stop resets the registry.
    let snap = registry.observe();
    coordinator.stop().await;
    tracing::info!(
        total_readings = snap.total_readings,
        total_batches_sent = snap.total_batches_sent,
        total_batches_failed = snap.total_batches_failed,
        "simulated drive finished",
    );
    Ok(())
}
