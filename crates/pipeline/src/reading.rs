// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sensor reading and batch data model.
//!
//! A reading is a tagged record: the `kind` tag selects which fields are
//! meaningful. Batches are the unit of persistence and transport; their
//! serialized form is the opaque payload stored in the queue.

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Sensor kind discriminant, used for per-kind throughput breakdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accel,
    Gyro,
    Location,
}

impl SensorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Accel => "accel",
            Self::Gyro => "gyro",
            Self::Location => "location",
        }
    }
}

/// One sensor sample. Timestamps are epoch milliseconds: monotonic enough
/// for ordering, not wall-clock-accurate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SensorReading {
    Accel {
        timestamp: u64,
        x: f64,
        y: f64,
        z: f64,
    },
    Gyro {
        timestamp: u64,
        x: f64,
        y: f64,
        z: f64,
    },
    Location {
        timestamp: u64,
        lat: f64,
        lng: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        accuracy: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        altitude: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        heading: Option<f64>,
    },
}

impl SensorReading {
    /// Build a location reading. Some OS sources report a negative speed for
    /// "unknown"; any non-finite or negative value is treated as absent.
    #[allow(clippy::too_many_arguments)]
    pub fn location(
        timestamp: u64,
        lat: f64,
        lng: f64,
        accuracy: Option<f64>,
        altitude: Option<f64>,
        speed: Option<f64>,
        heading: Option<f64>,
    ) -> Self {
        let speed = speed.filter(|s| s.is_finite() && *s >= 0.0);
        Self::Location { timestamp, lat, lng, accuracy, altitude, speed, heading }
    }

    pub fn kind(&self) -> SensorKind {
        match self {
            Self::Accel { .. } => SensorKind::Accel,
            Self::Gyro { .. } => SensorKind::Gyro,
            Self::Location { .. } => SensorKind::Location,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Accel { timestamp, .. }
            | Self::Gyro { timestamp, .. }
            | Self::Location { timestamp, .. } => *timestamp,
        }
    }
}

/// The unit of persistence and transport: an ordered run of readings under
/// one globally unique id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorBatch {
    pub batch_id: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    pub readings: Vec<SensorReading>,
}

impl SensorBatch {
    pub fn new(
        device_id: &str,
        driver_id: Option<String>,
        vehicle_id: Option<String>,
        readings: Vec<SensorReading>,
    ) -> Self {
        Self {
            batch_id: generate_batch_id(device_id, None),
            device_id: device_id.to_owned(),
            driver_id,
            vehicle_id,
            readings,
        }
    }

    /// Serialize to the opaque queue payload.
    pub fn to_payload(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a queue payload back into a batch. Fails on legacy
    /// SQL-interpolated payloads, which the transport handles separately.
    pub fn from_payload(payload: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Generate a batch id: `<device_id>_<time36>_<rand_hex>`, with an optional
/// tag segment (`final`, `bg`) between the device id and the timestamp.
/// Collision probability is negligible.
pub fn generate_batch_id(device_id: &str, tag: Option<&str>) -> String {
    let time36 = to_base36(epoch_ms());
    let rand_hex = format!("{:08x}", rand::rng().random::<u32>());
    match tag {
        Some(tag) => format!("{device_id}_{tag}_{time36}_{rand_hex}"),
        None => format!("{device_id}_{time36}_{rand_hex}"),
    }
}

/// Encode an integer in base 36 (lowercase), the compact timestamp form
/// used in generated ids.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

/// Return current epoch millis.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
#[path = "reading_tests.rs"]
mod tests;
