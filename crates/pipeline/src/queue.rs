// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable on-disk queue of pending sensor batches.
//!
//! One SQLite table in WAL mode holds every batch until it is acked by the
//! remote store or permanently failed. Inserts are micro-batched: callers
//! append to an in-memory buffer and a 50 ms window (or a 100-row threshold)
//! commits the whole run in one exclusive transaction, with a per-row
//! fallback if the transaction fails. Blocking rusqlite calls run under
//! `spawn_blocking`; the async surface never holds the connection across an
//! await point.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rusqlite::{params, Connection, TransactionBehavior};
use tokio_util::sync::CancellationToken;

use crate::reading::epoch_ms;

/// Hard cap on pending+sent rows; the pressure-relief valve for long
/// network outages on a storage-constrained device.
pub const MAX_QUEUE_DEPTH: i64 = 10_000;

/// Oldest-pending rows removed per eviction pass.
pub const EVICTION_BATCH_SIZE: usize = 500;

/// Failed rows are kept this long for diagnostics.
pub const FAILED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Micro-batch commit triggers.
const MICRO_BATCH_SIZE: usize = 100;
const MICRO_BATCH_WINDOW: Duration = Duration::from_millis(50);

/// Bulk ack chunk size, below SQLite's statement-parameter limit.
const ACK_CHUNK: usize = 500;

/// Cached depth counter refresh interval.
const DEPTH_REFRESH: Duration = Duration::from_secs(30);

/// Row deletions in one maintenance pass that warrant a WAL truncation
/// checkpoint.
const CHECKPOINT_THRESHOLD: usize = 100;

/// Queue row status. Transitions are one-way: pending → sent → acked, or
/// pending/sent → failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Failed => "failed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "sent" => Self::Sent,
            "acked" => Self::Acked,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One persisted batch.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: i64,
    pub batch_id: String,
    pub payload: String,
    pub qos: i64,
    pub status: RowStatus,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub acked_at: Option<i64>,
    pub retry_count: i64,
}

/// Per-status counts plus oldest-pending age.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: u64,
    pub sent: u64,
    pub acked: u64,
    pub failed: u64,
    pub oldest_pending_age_ms: Option<u64>,
}

struct MicroRow {
    batch_id: String,
    payload: String,
    qos: i64,
    created_at: i64,
}

struct QueueInner {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
    init_failed: AtomicBool,
    /// Cached pending+sent count; refreshed from the table at most every
    /// 30 s, adjusted incrementally in between.
    depth: AtomicI64,
    depth_refreshed: Mutex<Instant>,
    micro: Mutex<Vec<MicroRow>>,
    is_flushing: AtomicBool,
    cancel: CancellationToken,
}

/// Handle to the durable queue. Cheap to clone; the background task opens
/// its own handle to the same file (WAL allows a concurrent reader/writer).
#[derive(Clone)]
pub struct SensorQueue {
    inner: Arc<QueueInner>,
}

impl SensorQueue {
    /// Open (or create) the queue database and start the micro-batch flush
    /// window. Initialization failure does not fail the pipeline: the queue
    /// degrades to a no-op and `init_failed()` reports it.
    pub fn open(path: &Path) -> Self {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let (conn, init_failed) = match open_connection(path) {
            Ok(conn) => (Some(conn), false),
            Err(e) => {
                tracing::error!(path = %path.display(), err = %e, "queue init failed, persistence disabled");
                (None, true)
            }
        };
        let queue = Self {
            inner: Arc::new(QueueInner {
                path: path.to_owned(),
                conn: Mutex::new(conn),
                init_failed: AtomicBool::new(init_failed),
                depth: AtomicI64::new(0),
                depth_refreshed: Mutex::new(Instant::now()),
                micro: Mutex::new(Vec::new()),
                is_flushing: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        };
        if !init_failed {
            queue.refresh_depth_sync();
            queue.spawn_flush_window();
        }
        queue
    }

    /// Whether storage initialization failed and persistence is disabled.
    pub fn init_failed(&self) -> bool {
        self.inner.init_failed.load(Ordering::Relaxed)
    }

    /// Enqueue a batch through the micro-batch window. Returns false when
    /// the store is unavailable (data is silently skipped; the caller's
    /// transport may still deliver it).
    pub async fn insert_pending(&self, batch_id: &str, payload: &str, qos: i64) -> bool {
        if self.init_failed() {
            return false;
        }
        self.evict_if_over_cap().await;
        let trigger_flush = {
            let Ok(mut micro) = self.inner.micro.lock() else {
                return false;
            };
            micro.push(MicroRow {
                batch_id: batch_id.to_owned(),
                payload: payload.to_owned(),
                qos,
                created_at: epoch_ms() as i64,
            });
            micro.len() >= MICRO_BATCH_SIZE
        };
        // Optimistic: conflicts are subtracted back when the batch commits.
        self.inner.depth.fetch_add(1, Ordering::Relaxed);
        if trigger_flush {
            self.flush_micro().await;
        }
        true
    }

    /// Enqueue a batch bypassing the coalesce window, committing before
    /// returning. For contexts where the process may die imminently.
    pub async fn insert_pending_immediate(&self, batch_id: &str, payload: &str, qos: i64) -> bool {
        if self.init_failed() {
            return false;
        }
        self.evict_if_over_cap().await;
        let batch_id = batch_id.to_owned();
        let payload = payload.to_owned();
        let created_at = epoch_ms() as i64;
        let inserted = self
            .with_conn(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO sensor_batches
                       (batch_id, payload, qos, status, created_at, retry_count)
                     VALUES (?1, ?2, ?3, 'pending', ?4, 0)",
                    params![batch_id, payload, qos, created_at],
                )
            })
            .await
            .unwrap_or(0);
        self.inner.depth.fetch_add(inserted as i64, Ordering::Relaxed);
        inserted > 0
    }

    /// Conditional transition to `sent`; acked/failed rows are untouched.
    pub async fn mark_sent(&self, batch_id: &str) {
        let batch_id = batch_id.to_owned();
        let now = epoch_ms() as i64;
        let _ = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE sensor_batches SET status = 'sent', sent_at = COALESCE(sent_at, ?2)
                     WHERE batch_id = ?1 AND status IN ('pending', 'sent')",
                    params![batch_id, now],
                )
            })
            .await;
    }

    /// Conditional transition to `acked`.
    pub async fn mark_acked(&self, batch_id: &str) -> bool {
        let ids = [batch_id.to_owned()];
        self.mark_acked_bulk(&ids).await > 0
    }

    /// Ack many batches in chunks of at most 500 ids per statement.
    /// Returns the number of rows actually transitioned.
    pub async fn mark_acked_bulk(&self, batch_ids: &[String]) -> usize {
        if batch_ids.is_empty() {
            return 0;
        }
        let now = epoch_ms() as i64;
        let mut changed_total = 0usize;
        for chunk in batch_ids.chunks(ACK_CHUNK) {
            let ids: Vec<String> = chunk.to_vec();
            let changed = self
                .with_conn(move |conn| {
                    let placeholders =
                        std::iter::repeat("?").take(ids.len()).collect::<Vec<_>>().join(",");
                    let sql = format!(
                        "UPDATE sensor_batches
                         SET status = 'acked', acked_at = ?1, sent_at = COALESCE(sent_at, ?1)
                         WHERE batch_id IN ({placeholders}) AND status IN ('pending', 'sent')"
                    );
                    let mut stmt = conn.prepare(&sql)?;
                    let mut values: Vec<&dyn rusqlite::types::ToSql> = vec![&now];
                    for id in &ids {
                        values.push(id);
                    }
                    stmt.execute(values.as_slice())
                })
                .await
                .unwrap_or(0);
            changed_total += changed;
        }
        self.inner.depth.fetch_sub(changed_total as i64, Ordering::Relaxed);
        changed_total
    }

    /// Increment `retry_count` on a still-unacked row.
    pub async fn bump_retry(&self, batch_id: &str) {
        let batch_id = batch_id.to_owned();
        let _ = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE sensor_batches SET retry_count = retry_count + 1
                     WHERE batch_id = ?1 AND status IN ('pending', 'sent')",
                    params![batch_id],
                )
            })
            .await;
    }

    /// Terminal transition to `failed`.
    pub async fn mark_failed(&self, batch_id: &str) {
        let batch_id = batch_id.to_owned();
        let changed = self
            .with_conn(move |conn| {
                conn.execute(
                    "UPDATE sensor_batches SET status = 'failed'
                     WHERE batch_id = ?1 AND status IN ('pending', 'sent')",
                    params![batch_id],
                )
            })
            .await
            .unwrap_or(0);
        self.inner.depth.fetch_sub(changed as i64, Ordering::Relaxed);
    }

    /// Approximate pending+sent depth from the cached counter, refreshed
    /// from the table at most every 30 s.
    pub async fn count_pending(&self) -> u64 {
        let stale = self
            .inner
            .depth_refreshed
            .lock()
            .map(|at| at.elapsed() >= DEPTH_REFRESH)
            .unwrap_or(true);
        if stale {
            self.refresh_depth().await;
        }
        self.inner.depth.load(Ordering::Relaxed).max(0) as u64
    }

    /// Recount the depth from the table.
    pub async fn refresh_depth(&self) -> u64 {
        self.flush_micro().await;
        let count = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM sensor_batches WHERE status IN ('pending', 'sent')",
                    [],
                    |row| row.get::<_, i64>(0),
                )
            })
            .await
            .unwrap_or(0);
        self.inner.depth.store(count, Ordering::Relaxed);
        if let Ok(mut at) = self.inner.depth_refreshed.lock() {
            *at = Instant::now();
        }
        count.max(0) as u64
    }

    /// Up to `limit` unacked rows, oldest first. Flushes the micro-batch
    /// first so freshly enqueued batches are visible.
    pub async fn list_unacked(&self, limit: usize) -> Vec<QueueRow> {
        self.flush_micro().await;
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, batch_id, payload, qos, status, created_at, sent_at, acked_at, retry_count
                 FROM sensor_batches
                 WHERE status IN ('pending', 'sent')
                 ORDER BY created_at ASC, id ASC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(QueueRow {
                    id: row.get(0)?,
                    batch_id: row.get(1)?,
                    payload: row.get(2)?,
                    qos: row.get(3)?,
                    status: RowStatus::from_str(&row.get::<_, String>(4)?),
                    created_at: row.get(5)?,
                    sent_at: row.get(6)?,
                    acked_at: row.get(7)?,
                    retry_count: row.get(8)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
        .unwrap_or_default()
    }

    /// Per-status counts plus oldest-pending age in ms.
    pub async fn get_stats(&self) -> QueueStats {
        self.flush_micro().await;
        let now = epoch_ms() as i64;
        self.with_conn(move |conn| {
            let mut stats = QueueStats::default();
            let mut stmt =
                conn.prepare("SELECT status, COUNT(*) FROM sensor_batches GROUP BY status")?;
            let counts = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?;
            for entry in counts {
                let (status, count) = entry?;
                match RowStatus::from_str(&status) {
                    RowStatus::Pending => stats.pending = count,
                    RowStatus::Sent => stats.sent = count,
                    RowStatus::Acked => stats.acked = count,
                    RowStatus::Failed => stats.failed = count,
                }
            }
            let oldest: Option<i64> = conn
                .query_row(
                    "SELECT MIN(created_at) FROM sensor_batches WHERE status = 'pending'",
                    [],
                    |row| row.get(0),
                )
                .ok()
                .flatten();
            stats.oldest_pending_age_ms = oldest.map(|at| now.saturating_sub(at).max(0) as u64);
            Ok(stats)
        })
        .await
        .unwrap_or_default()
    }

    /// Purge expired acked/failed rows; checkpoint the WAL when enough rows
    /// were deleted (or unconditionally with `vacuum`).
    pub async fn perform_maintenance(
        &self,
        acked_retention: Duration,
        failed_retention: Duration,
        vacuum: bool,
    ) -> usize {
        self.flush_micro().await;
        let now = epoch_ms() as i64;
        let acked_cutoff = now - acked_retention.as_millis() as i64;
        let failed_cutoff = now - failed_retention.as_millis() as i64;
        let deleted = self
            .with_conn(move |conn| {
                let mut deleted = conn.execute(
                    "DELETE FROM sensor_batches WHERE status = 'acked' AND acked_at < ?1",
                    params![acked_cutoff],
                )?;
                deleted += conn.execute(
                    "DELETE FROM sensor_batches WHERE status = 'failed' AND created_at < ?1",
                    params![failed_cutoff],
                )?;
                if vacuum || deleted >= CHECKPOINT_THRESHOLD {
                    conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
                }
                Ok(deleted)
            })
            .await
            .unwrap_or(0);
        if deleted > 0 {
            tracing::debug!(deleted, "queue maintenance purged expired rows");
        }
        deleted
    }

    /// Flush the final micro-batch, checkpoint, and stop the flush window.
    pub async fn close(&self) {
        self.flush_micro().await;
        self.inner.cancel.cancel();
        let _ = self.with_conn(|conn| conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")).await;
    }

    /// Commit the in-memory micro-batch in one exclusive transaction.
    /// Serialized by the `is_flushing` flag; concurrent callers line up
    /// behind the next window tick.
    pub async fn flush_micro(&self) {
        if self.init_failed() {
            return;
        }
        if self
            .inner
            .is_flushing
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let rows: Vec<MicroRow> = match self.inner.micro.lock() {
            Ok(mut micro) => micro.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        if rows.is_empty() {
            self.inner.is_flushing.store(false, Ordering::Release);
            return;
        }
        let attempted = rows.len();
        let inserted = self
            .with_conn(move |conn| {
                match insert_rows_transactional(conn, &rows) {
                    Ok(n) => Ok(n),
                    Err(e) => {
                        // Keep the data: fall back to row-by-row inserts.
                        tracing::warn!(err = %e, rows = rows.len(), "micro-batch transaction failed, falling back to single inserts");
                        Ok(insert_rows_individually(conn, &rows))
                    }
                }
            })
            .await
            .unwrap_or(0);
        // Settle the optimistic depth bump for conflicting/failed rows.
        let overcount = attempted.saturating_sub(inserted);
        if overcount > 0 {
            self.inner.depth.fetch_sub(overcount as i64, Ordering::Relaxed);
        }
        self.inner.is_flushing.store(false, Ordering::Release);
    }

    /// If the cached depth is at the cap, evict the oldest pending rows.
    /// `sent` rows are preserved: they have already been transmitted and
    /// are awaiting ack.
    async fn evict_if_over_cap(&self) {
        if self.inner.depth.load(Ordering::Relaxed) < MAX_QUEUE_DEPTH {
            return;
        }
        self.flush_micro().await;
        let evicted = self
            .with_conn(|conn| {
                conn.execute(
                    "DELETE FROM sensor_batches WHERE id IN (
                         SELECT id FROM sensor_batches WHERE status = 'pending'
                         ORDER BY created_at ASC, id ASC LIMIT ?1
                     )",
                    params![EVICTION_BATCH_SIZE as i64],
                )
            })
            .await
            .unwrap_or(0);
        if evicted > 0 {
            self.inner.depth.fetch_sub(evicted as i64, Ordering::Relaxed);
            tracing::warn!(evicted, "queue over depth cap, evicted oldest pending rows");
        }
    }

    fn spawn_flush_window(&self) {
        let queue = self.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(MICRO_BATCH_WINDOW);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                queue.flush_micro().await;
            }
        });
    }

    fn refresh_depth_sync(&self) {
        let Ok(guard) = self.inner.conn.lock() else {
            return;
        };
        let Some(conn) = guard.as_ref() else {
            return;
        };
        if let Ok(count) = conn.query_row(
            "SELECT COUNT(*) FROM sensor_batches WHERE status IN ('pending', 'sent')",
            [],
            |row| row.get::<_, i64>(0),
        ) {
            self.inner.depth.store(count, Ordering::Relaxed);
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Option<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = inner.conn.lock().ok()?;
            let conn = guard.as_mut()?;
            match f(conn) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(path = %inner.path.display(), err = %e, "queue operation failed");
                    None
                }
            }
        })
        .await;
        result.ok().flatten()
    }
}

fn insert_rows_transactional(conn: &mut Connection, rows: &[MicroRow]) -> rusqlite::Result<usize> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Exclusive)?;
    let mut inserted = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO sensor_batches
               (batch_id, payload, qos, status, created_at, retry_count)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0)",
        )?;
        for row in rows {
            inserted += stmt.execute(params![row.batch_id, row.payload, row.qos, row.created_at])?;
        }
    }
    tx.commit()?;
    Ok(inserted)
}

fn insert_rows_individually(conn: &Connection, rows: &[MicroRow]) -> usize {
    let mut inserted = 0usize;
    for row in rows {
        match conn.execute(
            "INSERT OR IGNORE INTO sensor_batches
               (batch_id, payload, qos, status, created_at, retry_count)
             VALUES (?1, ?2, ?3, 'pending', ?4, 0)",
            params![row.batch_id, row.payload, row.qos, row.created_at],
        ) {
            Ok(n) => inserted += n,
            Err(e) => {
                tracing::warn!(batch_id = %row.batch_id, err = %e, "single insert failed, row dropped");
            }
        }
    }
    inserted
}

fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let mut conn = Connection::open(path)?;
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA busy_timeout=5000;
        PRAGMA cache_size=-4096;
        PRAGMA temp_store=MEMORY;
        PRAGMA mmap_size=67108864;
        "#,
    )?;
    init_schema(&mut conn)?;
    Ok(conn)
}

/// Create or migrate the schema. Version 1 deployments stored text
/// datetime columns; version 2 uses integer epoch ms throughout.
fn init_schema(conn: &mut Connection) -> anyhow::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT);",
    )?;
    let version: i64 = conn
        .query_row(
            "SELECT COALESCE(
                (SELECT CAST(value AS INTEGER) FROM metadata WHERE key = 'schema_version'), 0)",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if version == 0 {
        let table_exists: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = 'sensor_batches'",
            [],
            |row| row.get(0),
        )?;
        if table_exists {
            // Pre-versioning deployment: adopt it as v1 and migrate below.
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '1')",
                [],
            )?;
        } else {
            apply_schema(conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES ('schema_version', '2')",
                [],
            )?;
            return Ok(());
        }
    }

    if version <= 1 {
        migrate_text_timestamps(conn);
        conn.execute("UPDATE metadata SET value = '2' WHERE key = 'schema_version'", [])?;
    }
    Ok(())
}

fn apply_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sensor_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            batch_id TEXT NOT NULL UNIQUE,
            payload TEXT NOT NULL,
            qos INTEGER NOT NULL DEFAULT 1,
            status TEXT NOT NULL DEFAULT 'pending',
            created_at INTEGER NOT NULL,
            sent_at INTEGER,
            acked_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0
        );

        -- Drain-list query: unacked rows oldest-first.
        CREATE INDEX IF NOT EXISTS idx_batches_unacked
            ON sensor_batches(status, created_at ASC)
            WHERE status IN ('pending', 'sent');

        -- Retention cleanup.
        CREATE INDEX IF NOT EXISTS idx_batches_acked_at
            ON sensor_batches(acked_at)
            WHERE status = 'acked';
        CREATE INDEX IF NOT EXISTS idx_batches_failed_created
            ON sensor_batches(created_at)
            WHERE status = 'failed';
        "#,
    )
}

/// One-time best-effort conversion of legacy text datetime columns to
/// integer epoch ms. Non-fatal: a failed conversion leaves the row behind
/// and comparisons fall back to treating it as oldest.
fn migrate_text_timestamps(conn: &Connection) {
    for column in ["created_at", "sent_at", "acked_at"] {
        let sql = format!(
            "UPDATE sensor_batches
             SET {column} = CAST(strftime('%s', {column}) AS INTEGER) * 1000
             WHERE typeof({column}) = 'text' AND strftime('%s', {column}) IS NOT NULL"
        );
        match conn.execute(&sql, []) {
            Ok(migrated) if migrated > 0 => {
                tracing::info!(column, migrated, "migrated text timestamps to epoch ms");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(column, err = %e, "timestamp migration failed, continuing");
            }
        }
    }
    let _ = apply_schema(conn);
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
