// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Observable pipeline status and throughput counters.
//!
//! One owned struct with atomic counters and a mutex-protected latency ring.
//! Producers report through narrow methods; UI indicators subscribe to the
//! published snapshot and never touch pipeline internals.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::reading::SensorKind;

/// Consecutive send failures before the observable status reads `error`.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Queue depth at which the pipeline reports `draining`.
const DRAINING_DEPTH: u64 = 10;

/// Rolling latency window size.
const LATENCY_WINDOW: usize = 100;

/// Estimated wire size per reading, for bytes/s display.
const BYTES_PER_READING: u64 = 120;

/// Pipeline status as shown by UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Off,
    Live,
    Draining,
    Error,
}

impl StreamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Live => "live",
            Self::Draining => "draining",
            Self::Error => "error",
        }
    }
}

/// Derived statistics over the rolling latency window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub min_ms: u64,
    pub max_ms: u64,
    pub p95_ms: u64,
    pub last_ms: u64,
}

/// Per-second rates, recomputed by the 1 s roller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Rates {
    pub readings_per_sec: f64,
    pub accel_per_sec: f64,
    pub gyro_per_sec: f64,
    pub location_per_sec: f64,
    pub batches_sent_per_sec: f64,
    pub batches_failed_per_sec: f64,
    pub bytes_per_sec: f64,
}

/// Immutable snapshot consumed by observers.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputSnapshot {
    pub status: StreamStatus,
    pub consecutive_failures: u32,
    pub rates: Rates,
    pub total_readings: u64,
    pub total_batches_sent: u64,
    pub total_batches_failed: u64,
    pub total_bytes: u64,
    pub queue_depth: u64,
    pub has_pending: bool,
    pub latency: Option<LatencyStats>,
}

#[derive(Default)]
struct WindowCounters {
    readings: AtomicU64,
    accel: AtomicU64,
    gyro: AtomicU64,
    location: AtomicU64,
    batches_sent: AtomicU64,
    batches_failed: AtomicU64,
    bytes: AtomicU64,
}

impl WindowCounters {
    fn take(&self) -> [u64; 7] {
        [
            self.readings.swap(0, Ordering::Relaxed),
            self.accel.swap(0, Ordering::Relaxed),
            self.gyro.swap(0, Ordering::Relaxed),
            self.location.swap(0, Ordering::Relaxed),
            self.batches_sent.swap(0, Ordering::Relaxed),
            self.batches_failed.swap(0, Ordering::Relaxed),
            self.bytes.swap(0, Ordering::Relaxed),
        ]
    }
}

/// Shared status/throughput registry.
pub struct ThroughputRegistry {
    running: AtomicBool,
    consecutive_failures: AtomicU32,
    window: WindowCounters,
    total_readings: AtomicU64,
    total_batches_sent: AtomicU64,
    total_batches_failed: AtomicU64,
    total_bytes: AtomicU64,
    queue_depth: AtomicU64,
    latency_ring: Mutex<VecDeque<u64>>,
    rates: Mutex<Rates>,
    snapshot_tx: watch::Sender<ThroughputSnapshot>,
}

impl ThroughputRegistry {
    pub fn new() -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(ThroughputSnapshot {
            status: StreamStatus::Off,
            consecutive_failures: 0,
            rates: Rates::default(),
            total_readings: 0,
            total_batches_sent: 0,
            total_batches_failed: 0,
            total_bytes: 0,
            queue_depth: 0,
            has_pending: false,
            latency: None,
        });
        Arc::new(Self {
            running: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
            window: WindowCounters::default(),
            total_readings: AtomicU64::new(0),
            total_batches_sent: AtomicU64::new(0),
            total_batches_failed: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            queue_depth: AtomicU64::new(0),
            latency_ring: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            rates: Mutex::new(Rates::default()),
            snapshot_tx,
        })
    }

    /// Spawn the 1 s rate roller. The registry owns the cadence; the caller
    /// owns the cancellation token.
    pub fn spawn_roller(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(1));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last = tokio::time::Instant::now();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    tick = timer.tick() => {
                        let elapsed = tick.duration_since(last).as_secs_f64();
                        last = tick;
                        registry.roll(elapsed.max(0.001));
                    }
                }
            }
        });
    }

    /// Mark the pipeline running; status becomes `live` until reports say
    /// otherwise.
    pub fn set_running(&self) {
        self.running.store(true, Ordering::Relaxed);
        self.publish();
    }

    /// Reset to `off`: counters, totals, and the latency window all clear.
    pub fn set_off(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.window.take();
        self.total_readings.store(0, Ordering::Relaxed);
        self.total_batches_sent.store(0, Ordering::Relaxed);
        self.total_batches_failed.store(0, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.queue_depth.store(0, Ordering::Relaxed);
        if let Ok(mut ring) = self.latency_ring.lock() {
            ring.clear();
        }
        if let Ok(mut rates) = self.rates.lock() {
            *rates = Rates::default();
        }
        self.publish();
    }

    pub fn report_readings(&self, count: u64, kind: SensorKind) {
        self.window.readings.fetch_add(count, Ordering::Relaxed);
        self.total_readings.fetch_add(count, Ordering::Relaxed);
        let by_kind = match kind {
            SensorKind::Accel => &self.window.accel,
            SensorKind::Gyro => &self.window.gyro,
            SensorKind::Location => &self.window.location,
        };
        by_kind.fetch_add(count, Ordering::Relaxed);
    }

    pub fn report_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.publish();
    }

    pub fn report_failure(&self) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    pub fn report_batch_sent(&self, reading_count: u64) {
        let bytes = reading_count * BYTES_PER_READING;
        self.window.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.window.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_batches_sent.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn report_batch_failed(&self) {
        self.window.batches_failed.fetch_add(1, Ordering::Relaxed);
        self.total_batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report_latency(&self, millis: u64) {
        if let Ok(mut ring) = self.latency_ring.lock() {
            if ring.len() == LATENCY_WINDOW {
                ring.pop_front();
            }
            ring.push_back(millis);
        }
    }

    pub fn report_queue_depth(&self, depth: u64) {
        self.queue_depth.store(depth, Ordering::Relaxed);
        self.publish();
    }

    /// Current snapshot, assembled on demand.
    pub fn observe(&self) -> ThroughputSnapshot {
        self.snapshot()
    }

    /// Subscribe to snapshot updates (UI indicators).
    pub fn subscribe(&self) -> watch::Receiver<ThroughputSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Fold the window counters into per-second rates and publish.
    pub(crate) fn roll(&self, elapsed_secs: f64) {
        let [readings, accel, gyro, location, sent, failed, bytes] = self.window.take();
        let per_sec = |n: u64| n as f64 / elapsed_secs;
        let rates = Rates {
            readings_per_sec: per_sec(readings),
            accel_per_sec: per_sec(accel),
            gyro_per_sec: per_sec(gyro),
            location_per_sec: per_sec(location),
            batches_sent_per_sec: per_sec(sent),
            batches_failed_per_sec: per_sec(failed),
            bytes_per_sec: per_sec(bytes),
        };
        if let Ok(mut slot) = self.rates.lock() {
            *slot = rates;
        }
        self.publish();
    }

    fn derive_status(&self) -> StreamStatus {
        if !self.running.load(Ordering::Relaxed) {
            return StreamStatus::Off;
        }
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures >= FAILURE_THRESHOLD {
            return StreamStatus::Error;
        }
        if self.queue_depth.load(Ordering::Relaxed) >= DRAINING_DEPTH && failures == 0 {
            return StreamStatus::Draining;
        }
        StreamStatus::Live
    }

    fn latency_stats(&self) -> Option<LatencyStats> {
        let ring = self.latency_ring.lock().ok()?;
        if ring.is_empty() {
            return None;
        }
        let mut sorted: Vec<u64> = ring.iter().copied().collect();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        let p95_index = ((sorted.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        Some(LatencyStats {
            avg_ms: sum as f64 / sorted.len() as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p95_ms: sorted[p95_index.min(sorted.len() - 1)],
            last_ms: *ring.back()?,
        })
    }

    fn snapshot(&self) -> ThroughputSnapshot {
        let depth = self.queue_depth.load(Ordering::Relaxed);
        ThroughputSnapshot {
            status: self.derive_status(),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            rates: self.rates.lock().map(|r| *r).unwrap_or_default(),
            total_readings: self.total_readings.load(Ordering::Relaxed),
            total_batches_sent: self.total_batches_sent.load(Ordering::Relaxed),
            total_batches_failed: self.total_batches_failed.load(Ordering::Relaxed),
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            queue_depth: depth,
            has_pending: depth > 0,
            latency: self.latency_stats(),
        }
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.snapshot());
    }
}

#[cfg(test)]
#[path = "status_tests.rs"]
mod tests;
