// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Background location continuity.
//!
//! A separately registered OS task keeps delivering location fixes while
//! the main process is suspended. Each group of fixes becomes one
//! `bg_`-tagged batch, persisted immediately (the process may die at any
//! moment) and optionally sent directly under a breaker with a simpler
//! policy than the foreground client's. The task shares the queue file with
//! the foreground pipeline, so the drain loop picks up anything left behind
//! once the app resumes.

use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::queue::SensorQueue;
use crate::reading::{generate_batch_id, SensorBatch, SensorReading};
use crate::status::ThroughputRegistry;
use crate::transport::{CircuitBreaker, TransportClient, TransportSettings};

/// OS task registration key. The task is inherently process-wide.
pub const BACKGROUND_TASK_NAME: &str = "roadsense-background-location";

/// Background breaker: 5 failures open it for 60 s; one trial success
/// closes it again.
const BG_FAILURE_THRESHOLD: u32 = 5;
const BG_COOLDOWN: Duration = Duration::from_secs(60);

/// Everything the background task needs to run detached from the
/// foreground pipeline.
pub struct BackgroundSettings {
    pub queue_path: PathBuf,
    pub transport: TransportSettings,
    pub device_id: String,
    pub driver_id: Option<String>,
    pub vehicle_id: Option<String>,
}

fn active_slot() -> &'static Mutex<Option<CancellationToken>> {
    static ACTIVE: OnceLock<Mutex<Option<CancellationToken>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(None))
}

/// Register the background task. A prior registration is cancelled first;
/// the OS keys the task by name and there can only be one.
pub fn init(
    settings: BackgroundSettings,
    locations: mpsc::UnboundedReceiver<Vec<SensorReading>>,
) -> anyhow::Result<()> {
    let worker = BackgroundWorker::new(&settings)?;
    let cancel = CancellationToken::new();
    {
        let Ok(mut slot) = active_slot().lock() else {
            anyhow::bail!("background task registry poisoned");
        };
        if let Some(old) = slot.replace(cancel.clone()) {
            tracing::warn!(task = BACKGROUND_TASK_NAME, "replacing active background task");
            old.cancel();
        }
    }
    tokio::spawn(worker.run(locations, cancel));
    tracing::info!(task = BACKGROUND_TASK_NAME, "background location task registered");
    Ok(())
}

/// Deregister the background task. Safe to call on every shutdown path,
/// including when nothing is registered.
pub fn teardown() {
    let token = match active_slot().lock() {
        Ok(mut slot) => slot.take(),
        Err(_) => None,
    };
    if let Some(token) = token {
        token.cancel();
        tracing::info!(task = BACKGROUND_TASK_NAME, "background location task deregistered");
    }
}

pub fn is_active() -> bool {
    active_slot().lock().map(|slot| slot.is_some()).unwrap_or(false)
}

/// The loop body, separated from the singleton registration so it can be
/// exercised directly.
pub(crate) struct BackgroundWorker {
    queue: SensorQueue,
    client: TransportClient,
    device_id: String,
    driver_id: Option<String>,
    vehicle_id: Option<String>,
}

impl BackgroundWorker {
    pub(crate) fn new(settings: &BackgroundSettings) -> anyhow::Result<Self> {
        // Own queue handle: WAL mode allows the concurrent writer. Own
        // client and breaker: a background cooldown must not suppress the
        // foreground drain, and vice versa.
        let queue = SensorQueue::open(&settings.queue_path);
        let registry = ThroughputRegistry::new();
        let client = TransportClient::with_breaker(
            settings.transport.clone(),
            queue.clone(),
            registry,
            CircuitBreaker::with_policy(BG_FAILURE_THRESHOLD, BG_COOLDOWN, 1),
        )?;
        Ok(Self {
            queue,
            client,
            device_id: settings.device_id.clone(),
            driver_id: settings.driver_id.clone(),
            vehicle_id: settings.vehicle_id.clone(),
        })
    }

    pub(crate) async fn run(
        self,
        mut locations: mpsc::UnboundedReceiver<Vec<SensorReading>>,
        cancel: CancellationToken,
    ) {
        loop {
            let fixes = tokio::select! {
                _ = cancel.cancelled() => break,
                fixes = locations.recv() => match fixes {
                    Some(fixes) => fixes,
                    None => break,
                },
            };
            self.handle_fixes(fixes).await;
        }
        self.queue.close().await;
    }

    pub(crate) async fn handle_fixes(&self, fixes: Vec<SensorReading>) {
        if fixes.is_empty() {
            return;
        }
        let count = fixes.len();
        let batch = SensorBatch {
            batch_id: generate_batch_id(&self.device_id, Some("bg")),
            device_id: self.device_id.clone(),
            driver_id: self.driver_id.clone(),
            vehicle_id: self.vehicle_id.clone(),
            readings: fixes,
        };
        tracing::debug!(batch_id = %batch.batch_id, count, "persisting background locations");
        // Persist-then-send: the direct attempt is opportunistic, the row
        // is already safe when it runs.
        self.client.publish_now(batch).await;
    }

    #[cfg(test)]
    pub(crate) fn queue(&self) -> &SensorQueue {
        &self.queue
    }
}

#[cfg(test)]
#[path = "background_tests.rs"]
mod tests;
