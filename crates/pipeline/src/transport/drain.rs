// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Adaptive drain loop: re-reads the persistent queue and re-attempts
//! unacknowledged batches until the remote acks them.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::reading::SensorBatch;
use crate::transport::client::{SendError, TransportClient, COALESCE_MAX};

/// A batch whose retry count reaches this ceiling is marked failed and no
/// longer drained.
pub const MAX_QUEUE_RETRY_COUNT: i64 = 20;

/// Unacked rows fetched per pass, oldest first.
const DRAIN_FETCH: usize = 100;

/// Cadence while work exists / while the queue is empty or suppressed.
const DRAIN_FAST: Duration = Duration::from_secs(5);
const DRAIN_SLOW: Duration = Duration::from_secs(30);

/// In-pass retry backoff: base 1 s, doubling, up to 3 attempts per chunk.
const BACKOFF_BASE: Duration = Duration::from_secs(1);
const MAX_ATTEMPTS: u32 = 3;

/// Spawn the drain loop. The first pass runs immediately so a restart
/// picks up whatever a previous process left behind.
pub fn spawn_drain_loop(client: TransportClient, cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let interval = drain_pass(&client).await;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    });
}

enum ChunkOutcome {
    Sent,
    CircuitOpen,
    Failed,
}

/// One pass over the queue. Returns how long to sleep before the next.
pub(crate) async fn drain_pass(client: &TransportClient) -> Duration {
    let queue = client.queue().clone();

    let depth = queue.count_pending().await;
    client.registry().report_queue_depth(depth);

    // Suppressed while the breaker cools down.
    if !client.circuit_allows() {
        return DRAIN_SLOW;
    }

    let rows = queue.list_unacked(DRAIN_FETCH).await;
    if rows.is_empty() {
        return DRAIN_SLOW;
    }

    let mut current: Vec<SensorBatch> = Vec::new();
    let mut legacy: Vec<(String, String)> = Vec::new();
    for row in rows {
        if row.retry_count >= MAX_QUEUE_RETRY_COUNT {
            tracing::warn!(batch_id = %row.batch_id, retries = row.retry_count, "retry ceiling reached, marking failed");
            queue.mark_failed(&row.batch_id).await;
            client.registry().report_batch_failed();
            continue;
        }
        match SensorBatch::from_payload(&row.payload) {
            Ok(batch) => current.push(batch),
            Err(_) => legacy.push((row.batch_id, row.payload)),
        }
    }

    for chunk in current.chunks(COALESCE_MAX) {
        match send_chunk_with_backoff(client, chunk).await {
            ChunkOutcome::Sent => {}
            ChunkOutcome::CircuitOpen => return DRAIN_SLOW,
            ChunkOutcome::Failed => {
                // Network likely down: record the attempt and wait for the
                // next cycle rather than burning through the backlog.
                for batch in chunk {
                    queue.bump_retry(&batch.batch_id).await;
                }
                return DRAIN_FAST;
            }
        }
    }

    for (batch_id, payload) in &legacy {
        match client.send_legacy(batch_id, payload).await {
            Ok(()) => {}
            Err(SendError::CircuitOpen) => return DRAIN_SLOW,
            Err(e) => {
                tracing::debug!(batch_id = %batch_id, err = %e, "legacy payload send failed");
                queue.bump_retry(batch_id).await;
                return DRAIN_FAST;
            }
        }
    }

    DRAIN_FAST
}

async fn send_chunk_with_backoff(client: &TransportClient, chunk: &[SensorBatch]) -> ChunkOutcome {
    let mut backoff = BACKOFF_BASE;
    for attempt in 0..MAX_ATTEMPTS {
        match client.send_group(chunk).await {
            Ok(()) => return ChunkOutcome::Sent,
            Err(SendError::CircuitOpen) => {
                // Tripped mid-pass: a real attempt already failed unless
                // this was the first try.
                if attempt == 0 {
                    return ChunkOutcome::CircuitOpen;
                }
                return ChunkOutcome::Failed;
            }
            Err(e) => {
                if attempt + 1 == MAX_ATTEMPTS {
                    tracing::warn!(batches = chunk.len(), err = %e, "chunk send failed after retries");
                    return ChunkOutcome::Failed;
                }
                tracing::debug!(attempt, err = %e, "chunk send failed, backing off {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
    }
    ChunkOutcome::Failed
}

#[cfg(test)]
#[path = "drain_tests.rs"]
mod tests;
