//! Durable operation queue.
//!
//! Rows move `pending → processing → {completed, failed, cancelled, skipped}`
//! or `pending → cancelled`. Every transition is a conditional `UPDATE` on
//! the expected current status, so a row is claimed at most once and a
//! cancelled row is never overwritten by a late result.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use parvault_core::{
    OperationKind, OperationParams, OperationStatus, VaultError, VaultResult, unix_timestamp_ms,
};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::connection::{Storage, map_storage_error, query_rows};
use crate::metrics::{QueueMetrics, QueueMetricsSnapshot};
use crate::row::{conversion_error, get_json, get_optional_u32, json_text, path_text};

const OPERATION_COLUMNS: &str = "id, operation_type, parameters, status, created_at, started_at, \
     completed_at, updated_at, result, pid";

const ORPHANED_MESSAGE: &str = "processor terminated while operation was running";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub operation_type: OperationKind,
    pub parameters: OperationParams,
    pub status: OperationStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
    pub result: Option<Value>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub skipped: u64,
}

impl QueueDepth {
    #[must_use]
    pub const fn active(&self) -> u64 {
        self.pending + self.processing
    }

    fn slot(&mut self, status: OperationStatus) -> &mut u64 {
        match status {
            OperationStatus::Pending => &mut self.pending,
            OperationStatus::Processing => &mut self.processing,
            OperationStatus::Completed => &mut self.completed,
            OperationStatus::Failed => &mut self.failed,
            OperationStatus::Cancelled => &mut self.cancelled,
            OperationStatus::Skipped => &mut self.skipped,
        }
    }
}

/// Result of a terminal transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transition {
    Applied,
    /// The row had already left `processing` (typically cancelled).
    Superseded { current: OperationStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub previous: OperationStatus,
    /// Process to signal when the row was `processing`.
    pub pid: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct OperationQueue {
    storage: Arc<Storage>,
    metrics: Arc<QueueMetrics>,
}

impl OperationQueue {
    #[must_use]
    pub fn new(storage: Arc<Storage>) -> Self {
        Self {
            storage,
            metrics: Arc::new(QueueMetrics::default()),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    #[must_use]
    pub fn metrics_snapshot(&self) -> QueueMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validate and insert a `pending` entry, returning its id.
    pub fn enqueue(&self, kind: OperationKind, parameters: &OperationParams) -> VaultResult<i64> {
        parameters.validate(kind)?;
        let encoded = parameters.to_json()?;
        let now_ms = unix_timestamp_ms()?;
        let id = self.storage.transaction(|conn| {
            conn.execute(
                "INSERT INTO operation_queue (operation_type, parameters, status, created_at, updated_at) \
                 VALUES (?1, ?2, 'pending', ?3, ?3);",
                params![kind.as_str(), encoded, now_ms],
            )
            .map_err(map_storage_error)?;
            Ok(conn.last_insert_rowid())
        })?;

        self.metrics.total_enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "parvault.queue",
            op = "queue.enqueue",
            operation_id = id,
            operation_type = kind.as_str(),
            "operation enqueued"
        );
        Ok(id)
    }

    /// Claim the oldest pending entry unless `max_concurrent` entries are
    /// already processing. The count check and the claim share one
    /// transaction.
    pub fn claim_next(
        &self,
        processor_pid: u32,
        max_concurrent: usize,
    ) -> VaultResult<Option<Operation>> {
        let now_ms = unix_timestamp_ms()?;
        let limit = u64::try_from(max_concurrent).unwrap_or(u64::MAX);
        let claimed = self.storage.transaction(|conn| {
            if count_status(conn, OperationStatus::Processing)? >= limit {
                return Ok(None);
            }
            let Some(id) = conn
                .query_row(
                    "SELECT id FROM operation_queue WHERE status = 'pending' \
                     ORDER BY created_at ASC, id ASC LIMIT 1;",
                    [],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map_err(map_storage_error)?
            else {
                return Ok(None);
            };

            let updated = conn
                .execute(
                    "UPDATE operation_queue \
                     SET status = 'processing', started_at = ?1, updated_at = ?1, pid = ?2 \
                     WHERE id = ?3 AND status = 'pending';",
                    params![now_ms, processor_pid, id],
                )
                .map_err(map_storage_error)?;
            if updated != 1 {
                return Ok(None);
            }
            load_operation(conn, id)
        })?;

        if let Some(operation) = &claimed {
            self.metrics.total_claimed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(
                target: "parvault.queue",
                op = "queue.claim",
                operation_id = operation.id,
                operation_type = operation.operation_type.as_str(),
                "operation claimed"
            );
        }
        Ok(claimed)
    }

    /// Store the subprocess id of a processing entry so it can be signalled.
    pub fn record_pid(&self, id: i64, pid: u32) -> VaultResult<bool> {
        let now_ms = unix_timestamp_ms()?;
        let updated = self.storage.execute(
            "UPDATE operation_queue SET pid = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'processing';",
            params![pid, now_ms, id],
        )?;
        Ok(updated == 1)
    }

    pub fn complete(&self, id: i64, result: &Value) -> VaultResult<Transition> {
        self.finish(id, OperationStatus::Completed, result)
    }

    pub fn fail(&self, id: i64, result: &Value) -> VaultResult<Transition> {
        self.finish(id, OperationStatus::Failed, result)
    }

    pub fn skip(&self, id: i64, result: &Value) -> VaultResult<Transition> {
        self.finish(id, OperationStatus::Skipped, result)
    }

    fn finish(&self, id: i64, status: OperationStatus, result: &Value) -> VaultResult<Transition> {
        debug_assert!(OperationStatus::Processing.can_transition_to(status));
        let encoded = json_text(result)?;
        let now_ms = unix_timestamp_ms()?;
        let transition = self.storage.transaction(|conn| {
            let updated = conn
                .execute(
                    "UPDATE operation_queue \
                     SET status = ?1, result = ?2, completed_at = ?3, updated_at = ?3, pid = NULL \
                     WHERE id = ?4 AND status = 'processing';",
                    params![status.as_str(), encoded, now_ms, id],
                )
                .map_err(map_storage_error)?;
            if updated == 1 {
                return Ok(Transition::Applied);
            }
            let current = load_status(conn, id)?.ok_or_else(|| not_found(id))?;
            Ok(Transition::Superseded { current })
        })?;

        match transition {
            Transition::Applied => {
                let counter = match status {
                    OperationStatus::Completed => &self.metrics.total_completed,
                    OperationStatus::Skipped => &self.metrics.total_skipped,
                    _ => &self.metrics.total_failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    target: "parvault.queue",
                    op = "queue.finish",
                    operation_id = id,
                    status = status.as_str(),
                    "operation finished"
                );
            }
            Transition::Superseded { current } => {
                self.metrics.total_superseded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    target: "parvault.queue",
                    op = "queue.finish",
                    operation_id = id,
                    wanted = status.as_str(),
                    current = current.as_str(),
                    "operation left processing before its result was stored"
                );
            }
        }
        Ok(transition)
    }

    /// Cancel a pending or processing entry.
    ///
    /// The row moves to `cancelled` immediately. For a processing entry the
    /// recorded pid is returned so the caller can signal the subprocess.
    pub fn cancel(&self, id: i64) -> VaultResult<CancelOutcome> {
        let now_ms = unix_timestamp_ms()?;
        let outcome = self.storage.transaction(|conn| {
            let operation = load_operation(conn, id)?.ok_or_else(|| not_found(id))?;
            if !operation.status.can_transition_to(OperationStatus::Cancelled) {
                return Err(VaultError::Conflict {
                    message: format!(
                        "operation {id} is already {} and cannot be cancelled",
                        operation.status
                    ),
                });
            }
            let result = json_text(&json!({
                "cancelled": true,
                "previous_status": operation.status.as_str(),
            }))?;
            let updated = conn
                .execute(
                    "UPDATE operation_queue \
                     SET status = 'cancelled', result = ?1, completed_at = ?2, updated_at = ?2 \
                     WHERE id = ?3 AND status = ?4;",
                    params![result, now_ms, id, operation.status.as_str()],
                )
                .map_err(map_storage_error)?;
            if updated != 1 {
                return Err(VaultError::Conflict {
                    message: format!("operation {id} changed status during cancellation"),
                });
            }
            Ok(CancelOutcome {
                previous: operation.status,
                pid: if operation.status == OperationStatus::Processing {
                    operation.pid
                } else {
                    None
                },
            })
        })?;

        self.metrics.total_cancelled.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            target: "parvault.queue",
            op = "queue.cancel",
            operation_id = id,
            previous = outcome.previous.as_str(),
            pid = outcome.pid,
            "operation cancelled"
        );
        Ok(outcome)
    }

    pub fn status(&self, id: i64) -> VaultResult<Option<OperationStatus>> {
        self.storage.read(|conn| load_status(conn, id))
    }

    pub fn get(&self, id: i64) -> VaultResult<Option<Operation>> {
        self.storage.read(|conn| load_operation(conn, id))
    }

    /// Entries whose `parameters.path` equals `path`, newest first.
    pub fn for_path(&self, path: &Path) -> VaultResult<Vec<Operation>> {
        let path = path_text(path);
        self.storage.read(|conn| {
            query_rows(
                conn,
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM operation_queue \
                     WHERE json_extract(parameters, '$.path') = ?1 ORDER BY id DESC;"
                ),
                params![path],
                operation_from_row,
            )
        })
    }

    /// Pending and processing entries in claim order.
    pub fn active(&self) -> VaultResult<Vec<Operation>> {
        self.storage.read(|conn| {
            query_rows(
                conn,
                &format!(
                    "SELECT {OPERATION_COLUMNS} FROM operation_queue \
                     WHERE status IN ('pending', 'processing') ORDER BY created_at ASC, id ASC;"
                ),
                &[],
                operation_from_row,
            )
        })
    }

    pub fn recent(&self, limit: usize) -> VaultResult<Vec<Operation>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.storage.read(|conn| {
            query_rows(
                conn,
                &format!("SELECT {OPERATION_COLUMNS} FROM operation_queue ORDER BY id DESC LIMIT ?1;"),
                params![limit],
                operation_from_row,
            )
        })
    }

    pub fn count_processing(&self) -> VaultResult<u64> {
        self.storage
            .read(|conn| count_status(conn, OperationStatus::Processing))
    }

    pub fn queue_depth(&self) -> VaultResult<QueueDepth> {
        self.storage.read(|conn| {
            let rows = query_rows(
                conn,
                "SELECT status, COUNT(*) FROM operation_queue GROUP BY status;",
                &[],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )?;
            let mut depth = QueueDepth::default();
            for (status, count) in rows {
                match OperationStatus::parse(&status) {
                    Some(status) => *depth.slot(status) = u64::try_from(count).unwrap_or(0),
                    None => tracing::warn!(
                        target: "parvault.queue",
                        status = %status,
                        count,
                        "unknown operation status in queue"
                    ),
                }
            }
            Ok(depth)
        })
    }

    /// Fail `processing` entries nobody owns any more. `is_owned` gets each
    /// row's id and recorded pid; rows it rejects are failed.
    pub fn reconcile_orphans(
        &self,
        is_owned: impl Fn(i64, Option<u32>) -> bool,
    ) -> VaultResult<usize> {
        let now_ms = unix_timestamp_ms()?;
        let result = json_text(&json!({ "error": ORPHANED_MESSAGE, "code": "orphaned" }))?;
        let reconciled = self.storage.transaction(|conn| {
            let rows = query_rows(
                conn,
                "SELECT id, pid FROM operation_queue WHERE status = 'processing';",
                &[],
                |row| Ok((row.get::<_, i64>(0)?, get_optional_u32(row, 1)?)),
            )?;
            let mut reconciled = 0;
            for (id, pid) in rows {
                if is_owned(id, pid) {
                    continue;
                }
                reconciled += conn
                    .execute(
                        "UPDATE operation_queue \
                         SET status = 'failed', result = ?1, completed_at = ?2, updated_at = ?2, pid = NULL \
                         WHERE id = ?3 AND status = 'processing';",
                        params![result, now_ms, id],
                    )
                    .map_err(map_storage_error)?;
            }
            Ok(reconciled)
        })?;

        if reconciled > 0 {
            self.metrics.total_reconciled.fetch_add(
                u64::try_from(reconciled).unwrap_or(u64::MAX),
                Ordering::Relaxed,
            );
            tracing::warn!(
                target: "parvault.queue",
                op = "queue.reconcile",
                reconciled,
                "failed orphaned processing operations"
            );
        }
        Ok(reconciled)
    }

    /// Delete terminal entries last updated before `cutoff_ms`.
    pub fn purge_terminal_before(&self, cutoff_ms: i64) -> VaultResult<usize> {
        let purged = self.storage.execute(
            "DELETE FROM operation_queue \
             WHERE status IN ('completed', 'failed', 'cancelled', 'skipped') AND updated_at < ?1;",
            params![cutoff_ms],
        )?;
        if purged > 0 {
            self.metrics
                .total_purged
                .fetch_add(u64::try_from(purged).unwrap_or(u64::MAX), Ordering::Relaxed);
            tracing::debug!(
                target: "parvault.queue",
                op = "queue.purge",
                purged,
                cutoff_ms,
                "purged old terminal operations"
            );
        }
        Ok(purged)
    }
}

fn operation_from_row(row: &Row<'_>) -> rusqlite::Result<Operation> {
    let kind: String = row.get(1)?;
    let parameters: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Operation {
        id: row.get(0)?,
        operation_type: kind
            .parse()
            .map_err(|error| conversion_error(1, Type::Text, error))?,
        parameters: OperationParams::from_json(&parameters)
            .map_err(|error| conversion_error(2, Type::Text, error))?,
        status: OperationStatus::parse(&status).ok_or_else(|| {
            conversion_error(3, Type::Text, format!("unknown operation status {status:?}"))
        })?,
        created_at: row.get(4)?,
        started_at: row.get(5)?,
        completed_at: row.get(6)?,
        updated_at: row.get(7)?,
        result: get_json(row, 8)?,
        pid: get_optional_u32(row, 9)?,
    })
}

fn load_operation(conn: &Connection, id: i64) -> VaultResult<Option<Operation>> {
    conn.query_row(
        &format!("SELECT {OPERATION_COLUMNS} FROM operation_queue WHERE id = ?1;"),
        [id],
        operation_from_row,
    )
    .optional()
    .map_err(map_storage_error)
}

fn load_status(conn: &Connection, id: i64) -> VaultResult<Option<OperationStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM operation_queue WHERE id = ?1;",
            [id],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_storage_error)?;
    Ok(status.as_deref().and_then(OperationStatus::parse))
}

fn count_status(conn: &Connection, status: OperationStatus) -> VaultResult<u64> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM operation_queue WHERE status = ?1;",
            [status.as_str()],
            |row| row.get(0),
        )
        .map_err(map_storage_error)?;
    Ok(u64::try_from(count).unwrap_or(0))
}

fn not_found(id: i64) -> VaultError {
    VaultError::NotFound {
        entity: "operation_queue",
        key: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn queue() -> OperationQueue {
        OperationQueue::new(Arc::new(
            Storage::open_in_memory().expect("in-memory storage should open"),
        ))
    }

    fn verify_params(path: &str) -> OperationParams {
        OperationParams::for_path(PathBuf::from(path))
    }

    #[test]
    fn enqueue_rejects_missing_path_and_id() {
        let queue = queue();
        let err = queue
            .enqueue(OperationKind::Verify, &OperationParams::default())
            .expect_err("empty params must be rejected");
        assert!(err.is_validation());
        assert_eq!(queue.queue_depth().expect("depth"), QueueDepth::default());
    }

    #[test]
    fn claims_are_fifo_and_exclusive() {
        let queue = queue();
        let first = queue
            .enqueue(OperationKind::Verify, &verify_params("/a"))
            .expect("enqueue a");
        let second = queue
            .enqueue(OperationKind::Verify, &verify_params("/b"))
            .expect("enqueue b");

        let claimed = queue.claim_next(42, 4).expect("claim").expect("row");
        assert_eq!(claimed.id, first);
        assert_eq!(claimed.status, OperationStatus::Processing);
        assert_eq!(claimed.pid, Some(42));
        assert!(claimed.started_at.is_some());

        let next = queue.claim_next(42, 4).expect("claim").expect("row");
        assert_eq!(next.id, second);
        assert!(queue.claim_next(42, 4).expect("claim").is_none());
    }

    #[test]
    fn claim_respects_max_concurrent() {
        let queue = queue();
        for path in ["/a", "/b", "/c"] {
            queue
                .enqueue(OperationKind::Verify, &verify_params(path))
                .expect("enqueue");
        }

        assert!(queue.claim_next(1, 2).expect("claim").is_some());
        assert!(queue.claim_next(1, 2).expect("claim").is_some());
        assert!(
            queue.claim_next(1, 2).expect("claim").is_none(),
            "third claim must wait for a free slot"
        );
        assert_eq!(queue.count_processing().expect("count"), 2);
    }

    #[test]
    fn cancelled_row_is_never_overwritten() {
        let queue = queue();
        let id = queue
            .enqueue(OperationKind::Verify, &verify_params("/a"))
            .expect("enqueue");
        queue.claim_next(7, 1).expect("claim").expect("row");
        assert!(queue.record_pid(id, 4242).expect("record pid"));

        let outcome = queue.cancel(id).expect("cancel");
        assert_eq!(outcome.previous, OperationStatus::Processing);
        assert_eq!(outcome.pid, Some(4242));

        let transition = queue
            .complete(id, &json!({"status": "PROTECTED"}))
            .expect("complete");
        assert_eq!(
            transition,
            Transition::Superseded {
                current: OperationStatus::Cancelled
            }
        );
        let stored = queue.get(id).expect("get").expect("row");
        assert_eq!(stored.status, OperationStatus::Cancelled);
        assert_eq!(stored.result.expect("result")["cancelled"], json!(true));
        assert_eq!(queue.metrics_snapshot().total_superseded, 1);
    }

    #[test]
    fn cancel_pending_has_no_pid_and_terminal_is_conflict() {
        let queue = queue();
        let id = queue
            .enqueue(OperationKind::Repair, &OperationParams::for_id(3))
            .expect("enqueue");
        let outcome = queue.cancel(id).expect("cancel pending");
        assert_eq!(outcome.previous, OperationStatus::Pending);
        assert_eq!(outcome.pid, None);

        let err = queue.cancel(id).expect_err("second cancel");
        assert!(matches!(err, VaultError::Conflict { .. }));
        let err = queue.cancel(999).expect_err("unknown id");
        assert!(matches!(err, VaultError::NotFound { .. }));
    }

    #[test]
    fn terminal_statuses_are_recorded_with_results() {
        let queue = queue();
        let ids: Vec<i64> = ["/a", "/b", "/c"]
            .iter()
            .map(|path| {
                queue
                    .enqueue(OperationKind::Protect, &verify_params(path))
                    .expect("enqueue")
            })
            .collect();
        for _ in &ids {
            queue.claim_next(1, 8).expect("claim").expect("row");
        }

        assert_eq!(
            queue.complete(ids[0], &json!({"ok": true})).expect("complete"),
            Transition::Applied
        );
        assert_eq!(
            queue.fail(ids[1], &json!({"error": "boom"})).expect("fail"),
            Transition::Applied
        );
        assert_eq!(
            queue
                .skip(ids[2], &json!({"reason": "parity already exists"}))
                .expect("skip"),
            Transition::Applied
        );

        let depth = queue.queue_depth().expect("depth");
        assert_eq!(depth.completed, 1);
        assert_eq!(depth.failed, 1);
        assert_eq!(depth.skipped, 1);
        assert_eq!(depth.active(), 0);
        let failed = queue.get(ids[1]).expect("get").expect("row");
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.pid, None);
    }

    #[test]
    fn orphans_with_dead_pids_are_failed() {
        let queue = queue();
        let alive = queue
            .enqueue(OperationKind::Verify, &verify_params("/alive"))
            .expect("enqueue");
        let dead = queue
            .enqueue(OperationKind::Verify, &verify_params("/dead"))
            .expect("enqueue");
        queue.claim_next(100, 8).expect("claim").expect("row");
        queue.claim_next(200, 8).expect("claim").expect("row");

        let reconciled = queue
            .reconcile_orphans(|_, pid| pid == Some(100))
            .expect("reconcile");
        assert_eq!(reconciled, 1);
        assert_eq!(
            queue.status(alive).expect("status"),
            Some(OperationStatus::Processing)
        );
        let failed = queue.get(dead).expect("get").expect("row");
        assert_eq!(failed.status, OperationStatus::Failed);
        assert_eq!(failed.result.expect("result")["error"], json!(ORPHANED_MESSAGE));
    }

    #[test]
    fn purge_only_removes_old_terminal_rows() {
        let queue = queue();
        let done = queue
            .enqueue(OperationKind::Verify, &verify_params("/a"))
            .expect("enqueue");
        let pending = queue
            .enqueue(OperationKind::Verify, &verify_params("/b"))
            .expect("enqueue");
        queue.claim_next(1, 8).expect("claim").expect("row");
        queue.complete(done, &json!({})).expect("complete");

        let future = unix_timestamp_ms().expect("clock") + 60_000;
        assert_eq!(queue.purge_terminal_before(future).expect("purge"), 1);
        assert!(queue.get(done).expect("get").is_none());
        assert!(queue.get(pending).expect("get").is_some());
    }

    #[test]
    fn read_views_filter_by_path_and_activity() {
        let queue = queue();
        let a1 = queue
            .enqueue(OperationKind::Verify, &verify_params("/mnt/a"))
            .expect("enqueue");
        queue
            .enqueue(OperationKind::Verify, &verify_params("/mnt/b"))
            .expect("enqueue");
        let a2 = queue
            .enqueue(OperationKind::Repair, &verify_params("/mnt/a"))
            .expect("enqueue");
        queue.cancel(a1).expect("cancel");

        let for_a: Vec<i64> = queue
            .for_path(Path::new("/mnt/a"))
            .expect("for_path")
            .iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(for_a, vec![a2, a1]);
        assert_eq!(queue.active().expect("active").len(), 2);
        let recent = queue.recent(1).expect("recent");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, a2);
        assert_eq!(recent[0].operation_type, OperationKind::Repair);
    }
}
