// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::reading::SensorKind;
use std::sync::Mutex as StdMutex;

struct CollectingSink {
    readings: StdMutex<Vec<SensorReading>>,
}

impl CollectingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self { readings: StdMutex::new(Vec::new()) })
    }

    fn kinds(&self) -> Vec<SensorKind> {
        self.readings.lock().map(|r| r.iter().map(|x| x.kind()).collect()).unwrap_or_default()
    }

    fn count(&self) -> usize {
        self.readings.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl ReadingSink for CollectingSink {
    fn on_reading(&self, reading: SensorReading) {
        if let Ok(mut readings) = self.readings.lock() {
            readings.push(reading);
        }
    }
}

fn reader_with(
    platform: Arc<SimulatedPlatform>,
    sink: Arc<CollectingSink>,
) -> SensorReader {
    SensorReader::new(platform, Duration::from_millis(10), Duration::from_millis(20), sink)
}

#[tokio::test]
async fn motion_readings_flow_to_the_sink() {
    let platform = SimulatedPlatform::new();
    let sink = CollectingSink::new();
    let reader = reader_with(Arc::clone(&platform), Arc::clone(&sink));

    reader.start().expect("start");
    tokio::time::sleep(Duration::from_millis(100)).await;
    reader.stop();

    let kinds = sink.kinds();
    assert!(kinds.contains(&SensorKind::Accel));
    assert!(kinds.contains(&SensorKind::Gyro));
    // Accel and gyro arrive in pairs per tick; stop may clip one pair.
    let accel = kinds.iter().filter(|k| **k == SensorKind::Accel).count() as i64;
    let gyro = kinds.iter().filter(|k| **k == SensorKind::Gyro).count() as i64;
    assert!((accel - gyro).abs() <= 1, "accel {accel} vs gyro {gyro}");
}

#[tokio::test]
async fn location_failure_leaves_motion_running() {
    let platform = SimulatedPlatform::new();
    platform.set_fail_location(true);
    let sink = CollectingSink::new();
    let reader = reader_with(Arc::clone(&platform), Arc::clone(&sink));

    reader.start().expect("motion starts");
    assert!(reader.start_location().is_err());

    tokio::time::sleep(Duration::from_millis(60)).await;
    reader.stop();

    assert!(sink.count() > 0, "motion kept producing");
    assert!(!sink.kinds().contains(&SensorKind::Location));
}

#[tokio::test]
async fn ensure_all_sensors_rebinds_subscriptions() {
    let platform = SimulatedPlatform::new();
    let sink = CollectingSink::new();
    let reader = reader_with(Arc::clone(&platform), Arc::clone(&sink));

    reader.start().expect("start");
    reader.start_location().expect("location");
    assert_eq!(platform.motion_starts(), 1);

    // Resume after the OS tore subscriptions down.
    reader.ensure_all_sensors();
    assert_eq!(platform.motion_starts(), 2);
    assert_eq!(platform.location_starts(), 2);

    tokio::time::sleep(Duration::from_millis(80)).await;
    reader.stop();
    // Exactly one live subscription per kind: the rebind did not double
    // the production rate.
    let kinds = sink.kinds();
    let accel = kinds.iter().filter(|k| **k == SensorKind::Accel).count() as i64;
    let gyro = kinds.iter().filter(|k| **k == SensorKind::Gyro).count() as i64;
    assert!((accel - gyro).abs() <= 2, "accel {accel} vs gyro {gyro}");
    assert!(accel <= 12, "10 ms cadence over ~80 ms should stay near 8 ticks, got {accel}");
}

#[tokio::test]
async fn stop_is_safe_to_call_repeatedly() {
    let platform = SimulatedPlatform::new();
    let sink = CollectingSink::new();
    let reader = reader_with(Arc::clone(&platform), Arc::clone(&sink));

    reader.start().expect("start");
    reader.stop();
    reader.stop();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let count = sink.count();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.count(), count, "no readings after stop");
}

#[tokio::test]
async fn location_readings_normalize_speed() {
    let platform = SimulatedPlatform::new();
    let sink = CollectingSink::new();
    let reader = reader_with(Arc::clone(&platform), Arc::clone(&sink));

    reader.start_location().expect("location");
    tokio::time::sleep(Duration::from_millis(80)).await;
    reader.stop();

    let readings = sink.readings.lock().expect("lock").clone();
    assert!(!readings.is_empty());
    for reading in readings {
        let SensorReading::Location { speed, .. } = reading else {
            continue;
        };
        if let Some(speed) = speed {
            assert!(speed >= 0.0 && speed.is_finite());
        }
    }
}
