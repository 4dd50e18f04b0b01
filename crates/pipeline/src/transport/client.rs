// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batch publisher speaking the columnar store's HTTP insert protocol.
//!
//! One request carries a coalesced group of batches as newline-delimited
//! JSON rows. Success bulk-acks every member; failure leaves them in the
//! persistent queue for the drain loop.

use std::fmt;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use base64::Engine;
use tokio_util::sync::CancellationToken;

use crate::config::StreamConfig;
use crate::queue::SensorQueue;
use crate::reading::SensorBatch;
use crate::status::ThroughputRegistry;
use crate::transport::circuit::CircuitBreaker;

/// Coalesce buffer flush triggers.
pub(crate) const COALESCE_MAX: usize = 50;
const COALESCE_WINDOW: Duration = Duration::from_millis(100);

/// Every HTTP call is aborted after this long.
const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Insert statement for the JSONEachRow wire format.
const INSERT_QUERY: &str = "INSERT INTO rouptimize.sensor_queue FORMAT JSONEachRow";

/// Prefix for the legacy SQL-interpolated fallback path.
const LEGACY_QUERY_PREFIX: &str = "INSERT INTO rouptimize.sensor_queue VALUES ";

/// Endpoint and Basic credentials for the remote store.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub base_url: String,
    pub user: String,
    pub password: String,
}

impl TransportSettings {
    pub fn from_config(config: &StreamConfig) -> anyhow::Result<Self> {
        let base_url = config
            .clickhouse_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("CLICKHOUSE_URL not configured"))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            user: config.clickhouse_user.clone(),
            password: config.clickhouse_password.clone(),
        })
    }
}

/// Send failure classification. Retryability of a batch is decided by its
/// retry count on the drain side; this only drives logging and the breaker.
#[derive(Debug)]
pub enum SendError {
    /// The breaker rejected the call without touching the network.
    CircuitOpen,
    /// 5xx, 429, network error, or timeout.
    Retryable(String),
    /// Other 4xx: permanent for this payload.
    Permanent(String),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => f.write_str("circuit open"),
            Self::Retryable(reason) => write!(f, "retryable: {reason}"),
            Self::Permanent(reason) => write!(f, "permanent: {reason}"),
        }
    }
}

struct ClientInner {
    http: reqwest::Client,
    base_url: String,
    /// Computed once at construction, reused on every request.
    auth_header: String,
    queue: SensorQueue,
    registry: Arc<ThroughputRegistry>,
    circuit: Mutex<CircuitBreaker>,
    coalesce: Mutex<Vec<SensorBatch>>,
    cancel: CancellationToken,
}

/// Handle to the uploader. Cheap to clone; the drain loop and the coalesce
/// window share the same inner state.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl TransportClient {
    pub fn new(
        settings: TransportSettings,
        queue: SensorQueue,
        registry: Arc<ThroughputRegistry>,
    ) -> anyhow::Result<Self> {
        Self::with_breaker(settings, queue, registry, CircuitBreaker::new())
    }

    /// Construct with a custom breaker policy (the background task isolates
    /// its cooldown from the foreground client this way).
    pub fn with_breaker(
        settings: TransportSettings,
        queue: SensorQueue,
        registry: Arc<ThroughputRegistry>,
        breaker: CircuitBreaker,
    ) -> anyhow::Result<Self> {
        static CRYPTO_PROVIDER: Once = Once::new();
        CRYPTO_PROVIDER.call_once(|| {
            let _ = rustls::crypto::ring::default_provider().install_default();
        });
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        let credentials = format!("{}:{}", settings.user, settings.password);
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        );
        Ok(Self {
            inner: Arc::new(ClientInner {
                http,
                base_url: settings.base_url.trim_end_matches('/').to_owned(),
                auth_header,
                queue,
                registry,
                circuit: Mutex::new(breaker),
                coalesce: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Start the coalesce window and the drain loop.
    pub fn start(&self) {
        self.spawn_coalesce_window();
        crate::transport::drain::spawn_drain_loop(self.clone(), self.inner.cancel.clone());
    }

    /// Stop background tasks after one last coalesce flush. Anything still
    /// unacked stays in the queue and is drained on the next start.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.flush_coalesce().await;
    }

    /// Persist a batch and add it to the coalesce buffer. A full buffer
    /// flushes immediately; otherwise the 100 ms window does.
    pub async fn enqueue(&self, batch: SensorBatch) {
        let payload = match batch.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(batch_id = %batch.batch_id, err = %e, "batch serialization failed, dropped");
                return;
            }
        };
        self.inner.queue.insert_pending(&batch.batch_id, &payload, 1).await;
        let full = {
            let Ok(mut coalesce) = self.inner.coalesce.lock() else {
                return;
            };
            coalesce.push(batch);
            coalesce.len() >= COALESCE_MAX
        };
        if full {
            self.flush_coalesce().await;
        }
    }

    /// Persist immediately (no coalesce window) and attempt one direct
    /// send. Used on shutdown and from background contexts where the
    /// process may die imminently.
    pub async fn publish_now(&self, batch: SensorBatch) {
        let payload = match batch.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(batch_id = %batch.batch_id, err = %e, "batch serialization failed, dropped");
                return;
            }
        };
        self.inner.queue.insert_pending_immediate(&batch.batch_id, &payload, 1).await;
        if let Err(e) = self.send_group(std::slice::from_ref(&batch)).await {
            tracing::debug!(batch_id = %batch.batch_id, err = %e, "direct publish failed, left for drain");
        }
    }

    /// Drain the coalesce buffer into one HTTP request.
    pub(crate) async fn flush_coalesce(&self) {
        let group: Vec<SensorBatch> = {
            let Ok(mut coalesce) = self.inner.coalesce.lock() else {
                return;
            };
            coalesce.drain(..).collect()
        };
        if group.is_empty() {
            return;
        }
        if let Err(e) = self.send_group(&group).await {
            tracing::debug!(batches = group.len(), err = %e, "coalesced send failed, left for drain");
        }
    }

    /// Send a coalesced group. On 2xx every member is bulk-acked; any
    /// failure leaves them unacked in the queue.
    pub(crate) async fn send_group(&self, batches: &[SensorBatch]) -> Result<(), SendError> {
        if batches.is_empty() {
            return Ok(());
        }
        if !self.circuit_allows() {
            return Err(SendError::CircuitOpen);
        }

        // Only rows that actually made it into the body may be acked.
        let mut body = String::new();
        let mut members: Vec<(&str, u64)> = Vec::with_capacity(batches.len());
        for batch in batches {
            match wire_row(batch) {
                Ok(row) => {
                    body.push_str(&row);
                    body.push('\n');
                    members.push((&batch.batch_id, batch.readings.len() as u64));
                }
                Err(e) => {
                    tracing::warn!(batch_id = %batch.batch_id, err = %e, "skipping unencodable batch");
                }
            }
        }
        if members.is_empty() {
            return Ok(());
        }

        // Rows must be committed before the sent/acked transitions apply.
        self.inner.queue.flush_micro().await;
        for (batch_id, _) in &members {
            self.inner.queue.mark_sent(batch_id).await;
        }

        let result = self.post_insert(INSERT_QUERY, body).await;
        match result {
            Ok(()) => {
                let ids: Vec<String> = members.iter().map(|(id, _)| (*id).to_owned()).collect();
                self.inner.queue.mark_acked_bulk(&ids).await;
                self.inner.registry.report_success();
                for (_, reading_count) in &members {
                    self.inner.registry.report_batch_sent(*reading_count);
                }
                Ok(())
            }
            Err(e) => {
                self.inner.registry.report_failure();
                for _ in &members {
                    self.inner.registry.report_batch_failed();
                }
                Err(e)
            }
        }
    }

    /// Legacy migration path: a payload that predates the JSONEachRow
    /// format is forwarded verbatim as an interpolated VALUES insert in the
    /// query string. Read-only compatibility, never written anymore.
    pub(crate) async fn send_legacy(&self, batch_id: &str, payload: &str) -> Result<(), SendError> {
        if !self.circuit_allows() {
            return Err(SendError::CircuitOpen);
        }
        self.inner.queue.mark_sent(batch_id).await;
        let query = format!("{LEGACY_QUERY_PREFIX}{payload}");
        let result = self.post_insert(&query, String::new()).await;
        match result {
            Ok(()) => {
                self.inner.queue.mark_acked(batch_id).await;
                self.inner.registry.report_success();
                self.inner.registry.report_batch_sent(0);
                Ok(())
            }
            Err(e) => {
                self.inner.registry.report_failure();
                self.inner.registry.report_batch_failed();
                Err(e)
            }
        }
    }

    pub(crate) fn queue(&self) -> &SensorQueue {
        &self.inner.queue
    }

    pub(crate) fn registry(&self) -> &ThroughputRegistry {
        &self.inner.registry
    }

    /// Consult the breaker; an elapsed cooldown admits the trial call.
    pub(crate) fn circuit_allows(&self) -> bool {
        self.inner.circuit.lock().map(|mut breaker| breaker.allows_request()).unwrap_or(false)
    }

    /// POST one insert request and classify the outcome. Round-trip time is
    /// always reported to the registry, success or failure.
    async fn post_insert(&self, query: &str, body: String) -> Result<(), SendError> {
        let started = Instant::now();
        let response = self
            .inner
            .http
            .post(&self.inner.base_url)
            .query(&[("query", query)])
            .header(reqwest::header::AUTHORIZATION, &self.inner.auth_header)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await;
        let elapsed = started.elapsed();
        self.inner.registry.report_latency(elapsed.as_millis() as u64);

        match response {
            Ok(response) if response.status().is_success() => {
                self.record_circuit(true);
                Ok(())
            }
            Ok(response) => {
                let status = response.status();
                // 429 is pure back-pressure: retryable, but not a breaker
                // failure.
                if status.as_u16() != 429 {
                    self.record_circuit(false);
                }
                let reason = format!("http status {status}");
                if status.is_server_error() || status.as_u16() == 429 {
                    Err(SendError::Retryable(reason))
                } else {
                    Err(SendError::Permanent(reason))
                }
            }
            Err(e) => {
                self.record_circuit(false);
                Err(SendError::Retryable(e.to_string()))
            }
        }
    }

    fn record_circuit(&self, success: bool) {
        if let Ok(mut breaker) = self.inner.circuit.lock() {
            if success {
                breaker.record_success();
            } else {
                breaker.record_failure();
            }
        }
    }

    fn spawn_coalesce_window(&self) {
        let client = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(COALESCE_WINDOW);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                client.flush_coalesce().await;
            }
        });
    }
}

/// One JSONEachRow line. `readings` is a nested JSON string so the remote
/// accepts exactly the payload the queue persisted.
fn wire_row(batch: &SensorBatch) -> anyhow::Result<String> {
    let readings = serde_json::to_string(&batch.readings)?;
    Ok(serde_json::to_string(&serde_json::json!({
        "batch_id": batch.batch_id,
        "device_id": batch.device_id,
        "driver_id": batch.driver_id,
        "vehicle_id": batch.vehicle_id,
        "readings": readings,
    }))?)
}

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;
