// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline lifecycle owner.
//!
//! Ties the sensor reader, double buffer, persistent queue, and transport
//! together, computes the adaptive flush interval from the observed data
//! rate, and reacts to navigation/permission/authentication changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::background::{self, BackgroundSettings};
use crate::buffer::DoubleBuffer;
use crate::config::{StreamConfig, MAX_FLUSH_INTERVAL_MS, MIN_FLUSH_INTERVAL_MS};
use crate::identity::{DeviceIdentity, KeyStore, PermissionGate, PermissionHost};
use crate::queue::{SensorQueue, FAILED_RETENTION};
use crate::reading::{generate_batch_id, SensorBatch, SensorReading};
use crate::sensors::{ReadingSink, SensorPlatform, SensorReader, LOCATION_UPDATE_INTERVAL};
use crate::status::ThroughputRegistry;
use crate::transport::{TransportClient, TransportSettings};

/// Flush immediately once the write buffer holds this many readings.
const SIZE_THRESHOLD_FLUSH: usize = 200;

/// Adaptive flush targets one batch of about this many readings.
const TARGET_BATCH_SIZE: f64 = 100.0;

/// EMA smoothing toward the ideal interval.
const EMA_ALPHA: f64 = 0.3;

/// Minimum spacing between interval adjustments.
const ADJUST_WINDOW: Duration = Duration::from_secs(2);

/// Retry delay after a failed location subscription.
const LOCATION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Maintenance cadence: hourly, with a warm-up pass shortly after start.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
const MAINTENANCE_WARMUP: Duration = Duration::from_secs(30);

/// Authentication/navigation flags owned by the app shell. The coordinator
/// only reads them; `refresh()` reacts to changes.
pub struct SessionState {
    authenticated: AtomicBool,
    navigating: AtomicBool,
    driver_id: Mutex<Option<String>>,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            authenticated: AtomicBool::new(false),
            navigating: AtomicBool::new(false),
            driver_id: Mutex::new(None),
        })
    }

    pub fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::SeqCst);
    }

    pub fn set_navigating(&self, navigating: bool) {
        self.navigating.store(navigating, Ordering::SeqCst);
    }

    pub fn set_driver_id(&self, driver_id: Option<String>) {
        if let Ok(mut slot) = self.driver_id.lock() {
            *slot = driver_id;
        }
    }

    pub fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    pub fn navigating(&self) -> bool {
        self.navigating.load(Ordering::SeqCst)
    }

    pub fn driver_id(&self) -> Option<String> {
        self.driver_id.lock().ok().and_then(|d| d.clone())
    }
}

/// Vehicle assignment lookup, an external collaborator.
pub trait VehicleDirectory: Send + Sync + 'static {
    fn current_vehicle(&self, driver_id: &str) -> anyhow::Result<Option<String>>;
}

/// Directory for deployments without vehicle assignments.
pub struct NoVehicles;

impl VehicleDirectory for NoVehicles {
    fn current_vehicle(&self, _driver_id: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }
}

/// Ingestion half shared between the sensor callback and the flush driver:
/// the double buffer plus the size-threshold trigger.
struct Ingest {
    buffer: Mutex<DoubleBuffer>,
    window_count: AtomicU64,
    registry: Arc<ThroughputRegistry>,
    flush_now: Notify,
}

impl Ingest {
    fn new(registry: Arc<ThroughputRegistry>) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(DoubleBuffer::with_capacity(SIZE_THRESHOLD_FLUSH)),
            window_count: AtomicU64::new(0),
            registry,
            flush_now: Notify::new(),
        })
    }

    /// Move the buffered readings out for batching.
    fn drain(&self) -> Vec<SensorReading> {
        self.buffer.lock().map(|mut buffer| buffer.swap()).unwrap_or_default()
    }
}

impl ReadingSink for Ingest {
    fn on_reading(&self, reading: SensorReading) {
        self.registry.report_readings(1, reading.kind());
        self.window_count.fetch_add(1, Ordering::Relaxed);
        let len = match self.buffer.lock() {
            Ok(mut buffer) => {
                buffer.push(reading);
                buffer.len()
            }
            Err(_) => return,
        };
        if len >= SIZE_THRESHOLD_FLUSH {
            self.flush_now.notify_one();
        }
    }
}

struct RunningPipeline {
    queue: SensorQueue,
    client: TransportClient,
    reader: Arc<SensorReader>,
    ingest: Arc<Ingest>,
    cancel: CancellationToken,
    device_id: String,
    driver_id: Option<String>,
    vehicle_id: Option<String>,
}

struct CoordinatorInner {
    config: StreamConfig,
    platform: Arc<dyn SensorPlatform>,
    session: Arc<SessionState>,
    vehicles: Arc<dyn VehicleDirectory>,
    registry: Arc<ThroughputRegistry>,
    store: Arc<KeyStore>,
    gate: PermissionGate,
    run: tokio::sync::Mutex<Option<RunningPipeline>>,
}

/// Owns the pipeline lifecycle. One instance per process; UI observes
/// through the registry only.
#[derive(Clone)]
pub struct StreamCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl StreamCoordinator {
    pub fn new(
        config: StreamConfig,
        platform: Arc<dyn SensorPlatform>,
        permission_host: Arc<dyn PermissionHost>,
        session: Arc<SessionState>,
        vehicles: Arc<dyn VehicleDirectory>,
    ) -> Self {
        let store = Arc::new(KeyStore::open(&config.keystore_path()));
        let gate = PermissionGate::new(Arc::clone(&store), permission_host);
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                platform,
                session,
                vehicles,
                registry: ThroughputRegistry::new(),
                store,
                gate,
                run: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn registry(&self) -> Arc<ThroughputRegistry> {
        Arc::clone(&self.inner.registry)
    }

    pub fn permission_gate(&self) -> &PermissionGate {
        &self.inner.gate
    }

    pub async fn is_running(&self) -> bool {
        self.inner.run.lock().await.is_some()
    }

    fn preconditions_met(&self) -> bool {
        self.inner.session.authenticated()
            && self.inner.gate.status().allows_capture()
            && self.inner.session.navigating()
            && self.inner.config.streaming_enabled()
            && self.inner.platform.supports_sensors()
    }

    /// Re-evaluate preconditions and start or stop accordingly. The app
    /// shell calls this on every auth/navigation/permission change.
    pub async fn refresh(&self) {
        if self.preconditions_met() {
            if let Err(e) = self.start().await {
                tracing::warn!(err = %e, "pipeline start failed");
            }
        } else {
            self.stop().await;
        }
    }

    /// Bring the pipeline up. No-op when already running or when a
    /// precondition does not hold.
    pub async fn start(&self) -> anyhow::Result<()> {
        if !self.preconditions_met() {
            return Ok(());
        }
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            return Ok(());
        }

        let inner = &self.inner;
        let cancel = CancellationToken::new();

        // 1. Durable identity.
        let device = DeviceIdentity::resolve(&inner.store);
        let driver_id = inner.session.driver_id();

        // 2. Vehicle assignment, best-effort.
        let vehicle_id = match driver_id.as_deref() {
            Some(driver) => match inner.vehicles.current_vehicle(driver) {
                Ok(vehicle) => vehicle,
                Err(e) => {
                    tracing::warn!(err = %e, "vehicle assignment lookup failed");
                    None
                }
            },
            None => None,
        };

        // 3. Durable queue. Endpoint settings resolve first so a config
        // error cannot leave an orphaned queue flush task behind.
        let settings = TransportSettings::from_config(&inner.config)?;
        let queue = SensorQueue::open(&inner.config.queue_path());

        // 4. Transport with registry wiring.
        let client =
            TransportClient::new(settings.clone(), queue.clone(), Arc::clone(&inner.registry))?;
        client.start();

        // 5. Background location continuity.
        let (bg_tx, bg_rx) = tokio::sync::mpsc::unbounded_channel();
        match inner.platform.start_background_location(bg_tx) {
            Ok(()) => {
                let bg_settings = BackgroundSettings {
                    queue_path: inner.config.queue_path(),
                    transport: settings,
                    device_id: device.id().to_owned(),
                    driver_id: driver_id.clone(),
                    vehicle_id: vehicle_id.clone(),
                };
                if let Err(e) = background::init(bg_settings, bg_rx) {
                    tracing::warn!(err = %e, "background location init failed");
                }
            }
            Err(e) => tracing::warn!(err = %e, "background location registration failed"),
        }

        // 6. Sensor reader feeding the ingest buffer.
        let ingest = Ingest::new(Arc::clone(&inner.registry));
        let reader = Arc::new(SensorReader::new(
            Arc::clone(&inner.platform),
            inner.config.motion_update_interval(),
            LOCATION_UPDATE_INTERVAL,
            Arc::clone(&ingest) as Arc<dyn ReadingSink>,
        ));
        if let Err(e) = reader.start() {
            tracing::error!(err = %e, "motion subscription failed, pipeline continues without it");
        }
        if let Err(e) = reader.start_location() {
            tracing::warn!(err = %e, "location subscription failed, retrying in {LOCATION_RETRY_DELAY:?}");
            let reader = Arc::clone(&reader);
            let retry_cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = retry_cancel.cancelled() => return,
                    _ = tokio::time::sleep(LOCATION_RETRY_DELAY) => {}
                }
                if let Err(e) = reader.start_location() {
                    tracing::warn!(err = %e, "location subscription retry failed");
                }
            });
        }

        // 7. Periodic flush loop.
        self.spawn_flush_loop(
            Arc::clone(&ingest),
            client.clone(),
            device.id().to_owned(),
            driver_id.clone(),
            vehicle_id.clone(),
            cancel.clone(),
        );

        // 8. Maintenance: warm-up pass at +30 s, then hourly.
        self.spawn_maintenance(queue.clone(), cancel.clone());

        inner.registry.spawn_roller(cancel.clone());
        inner.registry.set_running();
        tracing::info!(device_id = %device.id(), "sensor streaming started");

        *run = Some(RunningPipeline {
            queue,
            client,
            reader,
            ingest,
            cancel,
            device_id: device.id().to_owned(),
            driver_id,
            vehicle_id,
        });
        Ok(())
    }

    /// Tear the pipeline down, flushing what remains. Safe when stopped.
    pub async fn stop(&self) {
        let Some(run) = self.inner.run.lock().await.take() else {
            return;
        };

        // 1. Cancel timers and loops.
        run.cancel.cancel();

        // 2. Final buffer swap: persist whatever is left, send detached.
        let leftovers = run.ingest.drain();
        if !leftovers.is_empty() {
            let batch = SensorBatch {
                batch_id: generate_batch_id(&run.device_id, Some("final")),
                device_id: run.device_id.clone(),
                driver_id: run.driver_id.clone(),
                vehicle_id: run.vehicle_id.clone(),
                readings: leftovers,
            };
            match batch.to_payload() {
                Ok(payload) => {
                    run.queue.insert_pending_immediate(&batch.batch_id, &payload, 1).await;
                    let client = run.client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = client.send_group(std::slice::from_ref(&batch)).await {
                            tracing::debug!(err = %e, "final batch send left for next session");
                        }
                    });
                }
                Err(e) => tracing::error!(err = %e, "final batch serialization failed"),
            }
        }

        // 3. Detach producers and the uploader.
        run.reader.stop();
        run.client.stop().await;

        // 4. Final micro-batch flush + WAL checkpoint.
        run.queue.close().await;

        // 5. Background task goes down on every shutdown path.
        background::teardown();

        // 6. Observable state resets.
        self.inner.registry.set_off();
        tracing::info!("sensor streaming stopped");
    }

    /// App returned to the foreground while navigating: re-verify the
    /// permission (one automatic recovery request if it was revoked) and
    /// rebind sensor subscriptions the OS may have torn down.
    pub async fn on_resume(&self) {
        let decision = self.inner.gate.verify_on_resume();
        if decision == crate::identity::PermissionDecision::Undetermined {
            self.inner.gate.request();
        }
        if !self.preconditions_met() {
            self.stop().await;
            return;
        }
        let rebound = {
            let run = self.inner.run.lock().await;
            match run.as_ref() {
                Some(run) => {
                    run.reader.ensure_all_sensors();
                    true
                }
                None => false,
            }
        };
        if !rebound {
            if let Err(e) = self.start().await {
                tracing::warn!(err = %e, "pipeline start on resume failed");
            }
        }
    }

    /// Suspension needs no action: background location continues and the
    /// buffered readings are bounded by the next foreground swap.
    pub fn on_suspend(&self) {
        tracing::debug!("app suspended, background location continues");
    }

    fn spawn_flush_loop(
        &self,
        ingest: Arc<Ingest>,
        client: TransportClient,
        device_id: String,
        driver_id: Option<String>,
        vehicle_id: Option<String>,
        cancel: CancellationToken,
    ) {
        let initial = self.inner.config.initial_flush_interval();
        tokio::spawn(async move {
            let mut interval_ms = initial.as_millis() as f64;
            let mut window_started = Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(interval_ms as u64)) => {}
                    _ = ingest.flush_now.notified() => {}
                }

                let readings = ingest.drain();
                if !readings.is_empty() {
                    let batch = SensorBatch {
                        batch_id: generate_batch_id(&device_id, None),
                        device_id: device_id.clone(),
                        driver_id: driver_id.clone(),
                        vehicle_id: vehicle_id.clone(),
                        readings,
                    };
                    client.enqueue(batch).await;
                }

                if window_started.elapsed() >= ADJUST_WINDOW {
                    let window = ingest.window_count.swap(0, Ordering::Relaxed);
                    let elapsed = window_started.elapsed().as_secs_f64();
                    interval_ms = next_interval_ms(interval_ms, window, elapsed);
                    window_started = Instant::now();
                    tracing::debug!(interval_ms, window, "flush interval adjusted");
                }
            }
        });
    }

    fn spawn_maintenance(&self, queue: SensorQueue, cancel: CancellationToken) {
        let acked_retention = self.inner.config.acked_retention();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(MAINTENANCE_WARMUP) => {}
            }
            queue.perform_maintenance(acked_retention, FAILED_RETENTION, false).await;

            let mut timer = tokio::time::interval(MAINTENANCE_INTERVAL);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            timer.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                queue.perform_maintenance(acked_retention, FAILED_RETENTION, false).await;
            }
        });
    }
}

/// Exponential moving average of the current interval toward the interval
/// that would produce [`TARGET_BATCH_SIZE`]-reading batches at the observed
/// rate, clamped into [50, 1000] ms. A silent window drifts toward the
/// ceiling.
fn next_interval_ms(current_ms: f64, window_readings: u64, elapsed_secs: f64) -> f64 {
    let rate = window_readings as f64 / elapsed_secs.max(0.001);
    let ideal = if rate > 0.0 {
        (TARGET_BATCH_SIZE / rate) * 1000.0
    } else {
        MAX_FLUSH_INTERVAL_MS as f64
    };
    let next = current_ms + EMA_ALPHA * (ideal - current_ms);
    next.clamp(MIN_FLUSH_INTERVAL_MS as f64, MAX_FLUSH_INTERVAL_MS as f64)
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;
