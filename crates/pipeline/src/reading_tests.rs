// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn accel_reading_serializes_with_kind_tag() -> anyhow::Result<()> {
    let r = SensorReading::Accel { timestamp: 1000, x: 0.1, y: -0.2, z: 9.8 };
    let json: serde_json::Value = serde_json::to_value(&r)?;
    assert_eq!(json["kind"], "accel");
    assert_eq!(json["timestamp"], 1000);
    assert_eq!(json["x"], 0.1);
    // No location fields leak into motion readings.
    assert_eq!(json.get("lat"), None);
    Ok(())
}

#[test]
fn location_omits_absent_optionals() -> anyhow::Result<()> {
    let r = SensorReading::location(2000, 52.5, 13.4, Some(5.0), None, None, None);
    let json: serde_json::Value = serde_json::to_value(&r)?;
    assert_eq!(json["kind"], "location");
    assert_eq!(json["accuracy"], 5.0);
    assert_eq!(json.get("altitude"), None);
    assert_eq!(json.get("speed"), None);
    assert_eq!(json.get("heading"), None);
    Ok(())
}

#[test]
fn negative_speed_treated_as_absent() {
    let r = SensorReading::location(0, 0.0, 0.0, None, None, Some(-1.0), None);
    let SensorReading::Location { speed, .. } = r else {
        unreachable!();
    };
    assert_eq!(speed, None);
}

#[test]
fn non_finite_speed_treated_as_absent() {
    let r = SensorReading::location(0, 0.0, 0.0, None, None, Some(f64::NAN), None);
    let SensorReading::Location { speed, .. } = r else {
        unreachable!();
    };
    assert_eq!(speed, None);

    let r = SensorReading::location(0, 0.0, 0.0, None, None, Some(3.2), None);
    let SensorReading::Location { speed, .. } = r else {
        unreachable!();
    };
    assert_eq!(speed, Some(3.2));
}

#[test]
fn batch_payload_round_trip() -> anyhow::Result<()> {
    let batch = SensorBatch::new(
        "dev_abc_12345678",
        Some("driver-1".into()),
        None,
        vec![
            SensorReading::Accel { timestamp: 1, x: 1.0, y: 2.0, z: 3.0 },
            SensorReading::Gyro { timestamp: 2, x: 0.1, y: 0.2, z: 0.3 },
            SensorReading::location(3, 52.5, 13.4, Some(4.0), Some(33.0), Some(8.5), Some(270.0)),
        ],
    );
    let payload = batch.to_payload()?;
    let back = SensorBatch::from_payload(&payload)?;
    assert_eq!(back, batch);
    Ok(())
}

#[test]
fn from_payload_rejects_legacy_values_format() {
    // Pre-JSONEachRow deployments stored SQL-interpolated payloads.
    let legacy = "('dev_x', 'driver', NULL, '[]')";
    assert!(SensorBatch::from_payload(legacy).is_err());
}

#[test]
fn batch_id_has_device_prefix_and_three_segments() {
    let id = generate_batch_id("dev_abc", None);
    assert!(id.starts_with("dev_abc_"));
    let rest = &id["dev_abc_".len()..];
    let parts: Vec<&str> = rest.split('_').collect();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[1].len(), 8, "rand segment is 8 hex chars: {id}");
}

#[test]
fn batch_id_tag_segment() {
    let id = generate_batch_id("dev_abc", Some("bg"));
    assert!(id.starts_with("dev_abc_bg_"), "{id}");
    let id = generate_batch_id("dev_abc", Some("final"));
    assert!(id.starts_with("dev_abc_final_"), "{id}");
}

#[test]
fn batch_ids_are_unique() {
    let a = generate_batch_id("dev", None);
    let b = generate_batch_id("dev", None);
    assert_ne!(a, b);
}

#[test]
fn base36_encoding() {
    assert_eq!(to_base36(0), "0");
    assert_eq!(to_base36(35), "z");
    assert_eq!(to_base36(36), "10");
    assert_eq!(to_base36(36 * 36 + 1), "101");
}

#[test]
fn reading_accessors() {
    let r = SensorReading::Gyro { timestamp: 77, x: 0.0, y: 0.0, z: 0.0 };
    assert_eq!(r.kind(), SensorKind::Gyro);
    assert_eq!(r.timestamp(), 77);
    assert_eq!(r.kind().as_str(), "gyro");
}
