// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sensor subscription layer.
//!
//! The OS sensor stack sits behind [`SensorPlatform`]; mobile builds bind it
//! to the native motion/location APIs, tests and the soak harness use
//! [`SimulatedPlatform`]. The reader normalizes everything into
//! [`SensorReading`] values delivered to one [`ReadingSink`].

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::reading::{epoch_ms, SensorReading};

/// Location fixes arrive at roughly this cadence, with the distance filter
/// disabled so stationary periods still produce fixes.
pub const LOCATION_UPDATE_INTERVAL: Duration = Duration::from_millis(1000);

/// Narrow interface the reader delivers readings through. The coordinator's
/// ingest half implements this; no closures cross the seam.
pub trait ReadingSink: Send + Sync + 'static {
    fn on_reading(&self, reading: SensorReading);
}

/// The OS seam. Subscriptions push readings into the provided channel until
/// stopped; re-subscribing replaces any prior subscription of that kind.
pub trait SensorPlatform: Send + Sync + 'static {
    /// Subscribe accelerometer + gyroscope at the given update interval.
    fn start_motion(
        &self,
        interval: Duration,
        tx: mpsc::UnboundedSender<SensorReading>,
    ) -> anyhow::Result<()>;

    /// Subscribe high-accuracy location. May fail independently of motion.
    fn start_location(
        &self,
        interval: Duration,
        tx: mpsc::UnboundedSender<SensorReading>,
    ) -> anyhow::Result<()>;

    /// Register the OS background-location task. Fix groups arrive through
    /// `tx` while the main process is suspended. Platforms without
    /// background support leave this a no-op.
    fn start_background_location(
        &self,
        tx: mpsc::UnboundedSender<Vec<SensorReading>>,
    ) -> anyhow::Result<()> {
        let _ = tx;
        Ok(())
    }

    /// Detach all subscriptions. Safe to call repeatedly.
    fn stop(&self);

    /// Whether this device has the required sensors at all.
    fn supports_sensors(&self) -> bool {
        true
    }
}

/// Subscribes to the platform and forwards normalized readings to the sink.
pub struct SensorReader {
    platform: Arc<dyn SensorPlatform>,
    motion_interval: Duration,
    location_interval: Duration,
    sink: Arc<dyn ReadingSink>,
    motion_forward: Mutex<Option<CancellationToken>>,
    location_forward: Mutex<Option<CancellationToken>>,
}

impl SensorReader {
    pub fn new(
        platform: Arc<dyn SensorPlatform>,
        motion_interval: Duration,
        location_interval: Duration,
        sink: Arc<dyn ReadingSink>,
    ) -> Self {
        Self {
            platform,
            motion_interval,
            location_interval,
            sink,
            motion_forward: Mutex::new(None),
            location_forward: Mutex::new(None),
        }
    }

    /// Subscribe accel/gyro. Re-subscribing replaces the previous binding,
    /// which makes this safe to call again after process resumption.
    pub fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.platform.start_motion(self.motion_interval, tx)?;
        self.replace_forwarder(&self.motion_forward, rx);
        Ok(())
    }

    /// Subscribe location. Failure here is recoverable: the coordinator
    /// retries later while accel/gyro keep flowing.
    pub fn start_location(&self) -> anyhow::Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.platform.start_location(self.location_interval, tx)?;
        self.replace_forwarder(&self.location_forward, rx);
        Ok(())
    }

    /// Idempotent re-subscription of everything, used after resume when the
    /// OS may have torn down foreground subscriptions.
    pub fn ensure_all_sensors(&self) {
        if let Err(e) = self.start() {
            tracing::warn!(err = %e, "motion re-subscription failed");
        }
        if let Err(e) = self.start_location() {
            tracing::warn!(err = %e, "location re-subscription failed");
        }
    }

    /// Detach all subscriptions. Safe to call multiple times.
    pub fn stop(&self) {
        self.platform.stop();
        for slot in [&self.motion_forward, &self.location_forward] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(token) = guard.take() {
                    token.cancel();
                }
            }
        }
    }

    fn replace_forwarder(
        &self,
        slot: &Mutex<Option<CancellationToken>>,
        mut rx: mpsc::UnboundedReceiver<SensorReading>,
    ) {
        let token = CancellationToken::new();
        if let Ok(mut guard) = slot.lock() {
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    reading = rx.recv() => {
                        match reading {
                            Some(reading) => sink.on_reading(reading),
                            None => break,
                        }
                    }
                }
            }
        });
    }
}

/// Deterministic in-process sensor source for tests and the soak harness.
pub struct SimulatedPlatform {
    motion_cancel: Mutex<Option<CancellationToken>>,
    location_cancel: Mutex<Option<CancellationToken>>,
    background_tx: Mutex<Option<mpsc::UnboundedSender<Vec<SensorReading>>>>,
    fail_motion: AtomicBool,
    fail_location: AtomicBool,
    motion_starts: AtomicU32,
    location_starts: AtomicU32,
}

impl SimulatedPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            motion_cancel: Mutex::new(None),
            location_cancel: Mutex::new(None),
            background_tx: Mutex::new(None),
            fail_motion: AtomicBool::new(false),
            fail_location: AtomicBool::new(false),
            motion_starts: AtomicU32::new(0),
            location_starts: AtomicU32::new(0),
        })
    }

    /// Deliver a group of background fixes, as the OS would while the app
    /// is suspended. Returns false when no background task is registered.
    pub fn send_background_fixes(&self, fixes: Vec<SensorReading>) -> bool {
        self.background_tx
            .lock()
            .ok()
            .and_then(|tx| tx.as_ref().map(|tx| tx.send(fixes).is_ok()))
            .unwrap_or(false)
    }

    /// Make subsequent start calls fail (permission lost, hardware gone).
    pub fn set_fail_motion(&self, fail: bool) {
        self.fail_motion.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_location(&self, fail: bool) {
        self.fail_location.store(fail, Ordering::SeqCst);
    }

    pub fn motion_starts(&self) -> u32 {
        self.motion_starts.load(Ordering::SeqCst)
    }

    pub fn location_starts(&self) -> u32 {
        self.location_starts.load(Ordering::SeqCst)
    }

    fn replace(slot: &Mutex<Option<CancellationToken>>) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut guard) = slot.lock() {
            if let Some(old) = guard.replace(token.clone()) {
                old.cancel();
            }
        }
        token
    }
}

impl SensorPlatform for SimulatedPlatform {
    fn start_motion(
        &self,
        interval: Duration,
        tx: mpsc::UnboundedSender<SensorReading>,
    ) -> anyhow::Result<()> {
        if self.fail_motion.load(Ordering::SeqCst) {
            anyhow::bail!("motion sensors unavailable");
        }
        self.motion_starts.fetch_add(1, Ordering::SeqCst);
        let token = Self::replace(&self.motion_cancel);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {}
                }
                tick += 1;
                let now = epoch_ms();
                let wobble = (tick as f64 * 0.1).sin() * 0.2;
                let accel = SensorReading::Accel { timestamp: now, x: wobble, y: -wobble, z: 9.81 };
                let gyro = SensorReading::Gyro {
                    timestamp: now,
                    x: wobble * 0.1,
                    y: 0.0,
                    z: wobble * 0.05,
                };
                if tx.send(accel).is_err() || tx.send(gyro).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn start_location(
        &self,
        interval: Duration,
        tx: mpsc::UnboundedSender<SensorReading>,
    ) -> anyhow::Result<()> {
        if self.fail_location.load(Ordering::SeqCst) {
            anyhow::bail!("location provider unavailable");
        }
        self.location_starts.fetch_add(1, Ordering::SeqCst);
        let token = Self::replace(&self.location_cancel);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut tick = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {}
                }
                tick += 1;
                let reading = SensorReading::location(
                    epoch_ms(),
                    52.520008 + tick as f64 * 0.00001,
                    13.404954 + tick as f64 * 0.00001,
                    Some(5.0),
                    Some(34.0),
                    Some(8.3),
                    Some(90.0),
                );
                if tx.send(reading).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn start_background_location(
        &self,
        tx: mpsc::UnboundedSender<Vec<SensorReading>>,
    ) -> anyhow::Result<()> {
        if let Ok(mut slot) = self.background_tx.lock() {
            *slot = Some(tx);
        }
        Ok(())
    }

    fn stop(&self) {
        for slot in [&self.motion_cancel, &self.location_cancel] {
            if let Ok(mut guard) = slot.lock() {
                if let Some(token) = guard.take() {
                    token.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "sensors_tests.rs"]
mod tests;
