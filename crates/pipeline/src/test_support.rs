// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: a mock columnar sink and batch builders.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;

use crate::queue::SensorQueue;
use crate::reading::{SensorBatch, SensorReading};
use crate::transport::TransportSettings;

/// One request observed by the mock sink, with the status it answered.
#[derive(Debug, Clone)]
pub struct SinkRequest {
    pub query: String,
    pub body: String,
    pub status: u16,
}

struct SinkState {
    requests: Mutex<Vec<SinkRequest>>,
    status: AtomicU16,
}

/// In-process stand-in for the remote store's HTTP insert endpoint.
pub struct MockSink {
    pub base_url: String,
    state: Arc<SinkState>,
}

impl MockSink {
    /// Bind an ephemeral port and serve until the test drops the runtime.
    pub async fn spawn() -> Self {
        let state = Arc::new(SinkState {
            requests: Mutex::new(Vec::new()),
            status: AtomicU16::new(200),
        });
        let app = Router::new().route("/", post(record)).with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self { base_url: format!("http://{addr}"), state }
    }

    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            base_url: self.base_url.clone(),
            user: "default".into(),
            password: "secret".into(),
        }
    }

    /// Status code returned to subsequent requests.
    pub fn set_status(&self, code: u16) {
        self.state.status.store(code, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<SinkRequest> {
        self.state.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.state.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Batch ids from request bodies that were answered 2xx.
    pub fn acked_batch_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        for request in self.requests() {
            if !(200..300).contains(&request.status) {
                continue;
            }
            for line in request.body.lines() {
                if let Ok(row) = serde_json::from_str::<serde_json::Value>(line) {
                    if let Some(id) = row.get("batch_id").and_then(|v| v.as_str()) {
                        ids.push(id.to_owned());
                    }
                }
            }
        }
        ids
    }
}

async fn record(
    State(state): State<Arc<SinkState>>,
    RawQuery(query): RawQuery,
    body: String,
) -> StatusCode {
    let status = state.status.load(Ordering::SeqCst);
    if let Ok(mut requests) = state.requests.lock() {
        requests.push(SinkRequest { query: query.unwrap_or_default(), body, status });
    }
    StatusCode::from_u16(status).unwrap_or(StatusCode::OK)
}

/// A batch of `count` accel readings under a fixed id.
pub fn test_batch(batch_id: &str, count: usize) -> SensorBatch {
    let readings = (0..count)
        .map(|i| SensorReading::Accel { timestamp: i as u64, x: 0.0, y: 0.0, z: 9.8 })
        .collect();
    SensorBatch {
        batch_id: batch_id.to_owned(),
        device_id: "dev_test".into(),
        driver_id: Some("driver-1".into()),
        vehicle_id: None,
        readings,
    }
}

/// A queue in a fresh temp dir; the dir guard must stay alive.
pub fn temp_queue() -> (tempfile::TempDir, SensorQueue) {
    let dir = tempfile::tempdir().expect("tempdir");
    let queue = SensorQueue::open(&dir.path().join("queue.db"));
    (dir, queue)
}
