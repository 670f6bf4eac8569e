//! Enqueuing side of the queue: validation, on-demand processor start,
//! cancellation and the read-only views other tools consume.

use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parvault_core::{OperationKind, OperationParams, OperationStatus, VaultError, VaultResult};
use parvault_durability::terminate_process;
use parvault_storage::{
    Operation, OperationQueue, ProtectedItem, QueueDepth, Storage, VerificationRecord,
    find_protected_items_by_path, get_protected_item, history_for_item, list_protected_items,
    redundancy_by_path,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::election::live_leader;

/// What [`ProcessorLauncher::ensure_running`] found or did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LaunchOutcome {
    AlreadyRunning { pid: u32 },
    Spawned { pid: u32 },
    Disabled,
}

/// Starts a detached `parvault run` when no live processor holds the lock.
#[derive(Debug, Clone)]
pub struct ProcessorLauncher {
    pid_file: PathBuf,
    program: Option<PathBuf>,
    forwarded_args: Vec<OsString>,
}

impl ProcessorLauncher {
    /// A launcher that never spawns; used by tests and embedders that run
    /// the processor themselves.
    #[must_use]
    pub fn disabled(pid_file: impl Into<PathBuf>) -> Self {
        Self {
            pid_file: pid_file.into(),
            program: None,
            forwarded_args: Vec::new(),
        }
    }

    /// Launch `program run <forwarded_args>`.
    #[must_use]
    pub fn new(
        pid_file: impl Into<PathBuf>,
        program: impl Into<PathBuf>,
        forwarded_args: Vec<OsString>,
    ) -> Self {
        Self {
            pid_file: pid_file.into(),
            program: Some(program.into()),
            forwarded_args,
        }
    }

    /// Relaunch the running executable.
    pub fn current_exe(
        pid_file: impl Into<PathBuf>,
        forwarded_args: Vec<OsString>,
    ) -> VaultResult<Self> {
        Ok(Self::new(pid_file, std::env::current_exe()?, forwarded_args))
    }

    #[must_use]
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    pub fn ensure_running(&self) -> VaultResult<LaunchOutcome> {
        if let Some(leader) = live_leader(&self.pid_file) {
            return Ok(LaunchOutcome::AlreadyRunning { pid: leader.pid });
        }
        let Some(program) = &self.program else {
            return Ok(LaunchOutcome::Disabled);
        };

        let mut child = Command::new(program)
            .arg("run")
            .args(&self.forwarded_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .map_err(|source| VaultError::ToolSpawn {
                binary: program.clone(),
                source,
            })?;
        let pid = child.id();
        // Reap the child if this process outlives it.
        thread::spawn(move || child.wait());

        info!(
            target: "parvault.processor",
            op = "processor.launch",
            pid,
            program = %program.display(),
            "queue processor launched"
        );
        Ok(LaunchOutcome::Spawned { pid })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnqueueReceipt {
    pub success: bool,
    pub operation_id: i64,
    pub processor: Option<LaunchOutcome>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CancelReceipt {
    pub operation_id: i64,
    pub previous_status: OperationStatus,
    /// Subprocess that received SIGTERM from this call.
    pub signalled_pid: Option<u32>,
}

/// Queue facade for everything that is not the processor.
#[derive(Debug, Clone)]
pub struct QueueService {
    storage: Arc<Storage>,
    queue: OperationQueue,
    launcher: ProcessorLauncher,
    terminate_grace: Duration,
}

impl QueueService {
    #[must_use]
    pub fn new(storage: Arc<Storage>, launcher: ProcessorLauncher, terminate_grace: Duration) -> Self {
        Self {
            queue: OperationQueue::new(Arc::clone(&storage)),
            storage,
            launcher,
            terminate_grace,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    /// Validate and enqueue, then make sure a processor will pick it up.
    /// A failed launch is logged; the entry stays pending for the next one.
    pub fn add_operation(
        &self,
        kind: OperationKind,
        params: &OperationParams,
    ) -> VaultResult<EnqueueReceipt> {
        let operation_id = self.queue.enqueue(kind, params)?;
        let processor = match self.launcher.ensure_running() {
            Ok(outcome) => Some(outcome),
            Err(error) => {
                warn!(
                    target: "parvault.processor",
                    operation_id,
                    error = %error,
                    "could not launch queue processor"
                );
                None
            }
        };
        Ok(EnqueueReceipt {
            success: true,
            operation_id,
            processor,
        })
    }

    /// Move the entry to `cancelled` and stop its subprocess.
    ///
    /// A pid that belongs to the live processor (or to this process) is never
    /// signalled: the processor notices the status change and cancels the
    /// subprocess itself.
    pub fn cancel(&self, operation_id: i64) -> VaultResult<CancelReceipt> {
        let outcome = self.queue.cancel(operation_id)?;
        let leader = live_leader(self.launcher.pid_file()).map(|contents| contents.pid);
        let signalled_pid = match outcome.pid {
            Some(pid)
                if pid != std::process::id()
                    && Some(pid) != leader
                    && terminate_process(pid, self.terminate_grace) =>
            {
                Some(pid)
            }
            _ => None,
        };
        debug!(
            target: "parvault.queue",
            operation_id,
            recorded_pid = outcome.pid,
            signalled_pid,
            "cancel handled"
        );
        Ok(CancelReceipt {
            operation_id,
            previous_status: outcome.previous,
            signalled_pid,
        })
    }

    pub fn operation(&self, operation_id: i64) -> VaultResult<Operation> {
        self.queue
            .get(operation_id)?
            .ok_or_else(|| VaultError::NotFound {
                entity: "operation_queue",
                key: operation_id.to_string(),
            })
    }

    pub fn operations_for_path(&self, path: &Path) -> VaultResult<Vec<Operation>> {
        self.queue.for_path(path)
    }

    pub fn active_operations(&self) -> VaultResult<Vec<Operation>> {
        self.queue.active()
    }

    pub fn recent_operations(&self, limit: usize) -> VaultResult<Vec<Operation>> {
        self.queue.recent(limit)
    }

    pub fn queue_depth(&self) -> VaultResult<QueueDepth> {
        self.queue.queue_depth()
    }

    pub fn items(&self) -> VaultResult<Vec<ProtectedItem>> {
        self.storage.read(list_protected_items)
    }

    pub fn item(&self, item_id: i64) -> VaultResult<ProtectedItem> {
        self.storage
            .read(|conn| get_protected_item(conn, item_id))?
            .ok_or_else(|| VaultError::NotFound {
                entity: "protected_items",
                key: item_id.to_string(),
            })
    }

    pub fn items_by_path(&self, path: &Path) -> VaultResult<Vec<ProtectedItem>> {
        self.storage.read(|conn| find_protected_items_by_path(conn, path))
    }

    pub fn redundancy_by_path(&self, path: &Path) -> VaultResult<Option<u8>> {
        self.storage.read(|conn| redundancy_by_path(conn, path))
    }

    pub fn history(&self, item_id: i64, limit: usize) -> VaultResult<Vec<VerificationRecord>> {
        self.storage.read(|conn| history_for_item(conn, item_id, limit))
    }
}

#[cfg(test)]
mod tests {
    use parvault_storage::{NewProtectedItem, append_history, upsert_protected_item};
    use parvault_core::{ItemStatus, ProtectionMode};

    use super::*;

    fn service(dir: &tempfile::TempDir) -> QueueService {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        QueueService::new(
            storage,
            ProcessorLauncher::disabled(dir.path().join("processor.pid")),
            Duration::from_millis(100),
        )
    }

    #[test]
    fn add_operation_returns_receipt_without_launching() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let receipt = service
            .add_operation(OperationKind::Verify, &OperationParams::for_id(7))
            .unwrap();
        assert!(receipt.success);
        assert_eq!(receipt.processor, Some(LaunchOutcome::Disabled));
        let operation = service.operation(receipt.operation_id).unwrap();
        assert_eq!(operation.status, OperationStatus::Pending);
        assert_eq!(service.queue_depth().unwrap().pending, 1);
    }

    #[test]
    fn add_operation_rejects_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let error = service
            .add_operation(OperationKind::Repair, &OperationParams::default())
            .unwrap_err();
        assert!(error.is_validation());
        assert!(service.recent_operations(10).unwrap().is_empty());
    }

    #[test]
    fn cancel_never_signals_this_process() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let id = service
            .add_operation(OperationKind::Verify, &OperationParams::for_path("/data"))
            .unwrap()
            .operation_id;
        service.queue().claim_next(std::process::id(), 2).unwrap().unwrap();

        let receipt = service.cancel(id).unwrap();
        assert_eq!(receipt.previous_status, OperationStatus::Processing);
        assert_eq!(receipt.signalled_pid, None);
        assert_eq!(service.operation(id).unwrap().status, OperationStatus::Cancelled);

        let again = service.cancel(id).unwrap_err();
        assert_eq!(again.code(), "conflict");
    }

    #[test]
    fn item_views_read_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let service = service(&dir);
        let path = PathBuf::from("/mnt/user/docs");
        let item = NewProtectedItem {
            path: path.clone(),
            mode: ProtectionMode::Directory,
            redundancy: 15,
            size: 10,
            data_size: 10,
            par2_size: 2,
            par2_path: path.join(".parity"),
            file_types: None,
            parent_dir: None,
            protected_files: Some(vec![path.join("a.txt")]),
            parent_item_id: None,
        };
        let id = service
            .storage
            .transaction(|conn| {
                let id = upsert_protected_item(conn, &item, 1_000)?;
                append_history(conn, id, ItemStatus::Protected, Some("Protected"), 1_000)?;
                Ok(id)
            })
            .unwrap();

        assert_eq!(service.items().unwrap().len(), 1);
        assert_eq!(service.item(id).unwrap().redundancy, 15);
        assert_eq!(service.items_by_path(&path).unwrap().len(), 1);
        assert_eq!(service.redundancy_by_path(&path).unwrap(), Some(15));
        assert_eq!(service.history(id, 10).unwrap().len(), 1);
        assert_eq!(service.item(id + 1).unwrap_err().code(), "not_found");
    }
}
