//! Operation handlers: one module per operation kind.
//!
//! Handlers return an [`ActionOutcome`] for every result that is a finding
//! (including verification failures that are recorded as history) and an
//! `Err` for everything else. The processor turns both into a terminal row.

use std::path::PathBuf;
use std::sync::Arc;

use parvault_core::{
    ItemStatus, OperationKind, OperationParams, ProtectionMode, VaultError, VaultResult,
    normalize_file_types, unix_timestamp_ms,
};
use parvault_durability::{
    CancellationToken, CommandBuilder, MetadataManager, Par2Command, Par2Runner, ParityLayout,
    ParitySet, ProcessOutcome, discover_index_files,
};
use parvault_storage::{
    Operation, OperationQueue, ProtectedItem, Storage, append_history, find_protected_items_by_path,
    get_protected_item, list_children, update_item_status,
};
use serde_json::{Value, json};
use tracing::warn;

use crate::config::VaultConfig;

pub mod protect;
pub mod remove;
pub mod repair;
pub mod verify;

/// Shared services handed to every worker thread.
#[derive(Debug, Clone)]
pub struct ActionEnv {
    pub storage: Arc<Storage>,
    pub queue: OperationQueue,
    pub config: Arc<VaultConfig>,
    pub runner: Par2Runner,
    pub metadata: MetadataManager,
    /// Host cores, for par2 `-t`.
    pub cores: usize,
}

impl ActionEnv {
    #[must_use]
    pub fn new(storage: Arc<Storage>, config: Arc<VaultConfig>, cores: usize) -> Self {
        Self {
            queue: OperationQueue::new(Arc::clone(&storage)),
            runner: Par2Runner::from_config(&config.parity),
            metadata: MetadataManager::new(
                Arc::clone(&storage),
                config.parity.parity_dir_name.clone(),
            ),
            storage,
            config,
            cores,
        }
    }
}

/// Terminal result of a handler that ran to the end.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Completed(Value),
    /// Nothing to do; the value explains why.
    Skipped(Value),
    /// A recorded finding that still fails the operation.
    Failed(Value),
}

/// One claimed operation being executed.
#[derive(Debug)]
pub struct OperationRun<'a> {
    pub env: &'a ActionEnv,
    pub operation_id: i64,
    pub token: &'a CancellationToken,
}

impl OperationRun<'_> {
    fn builder(&self) -> CommandBuilder<'_> {
        CommandBuilder::new(&self.env.config.parity, self.env.cores)
    }

    fn layout(&self) -> ParityLayout<'_> {
        ParityLayout::new(&self.env.config.parity)
    }

    /// Run par2, stamping the subprocess pid on the queue row so `cancel`
    /// from another process can signal it. The row points back at the
    /// processor once the subprocess is gone.
    fn run_par2(&self, command: &Par2Command) -> VaultResult<ProcessOutcome> {
        if self.token.is_cancelled() {
            return Err(VaultError::Cancelled {
                operation_id: self.operation_id,
            });
        }
        let outcome = self
            .env
            .runner
            .run(command, self.operation_id, self.token, |pid| self.stamp_pid(pid));
        self.stamp_pid(std::process::id());
        outcome
    }

    fn stamp_pid(&self, pid: u32) {
        if let Err(error) = self.env.queue.record_pid(self.operation_id, pid) {
            warn!(
                target: "parvault.processor",
                operation_id = self.operation_id,
                pid,
                error = %error,
                "could not record subprocess pid"
            );
        }
    }

    /// Item status plus one history row, in one transaction.
    fn record_status(&self, item_id: i64, status: ItemStatus, details: &str) -> VaultResult<()> {
        let now = unix_timestamp_ms()?;
        self.env.storage.transaction(|conn| {
            update_item_status(conn, item_id, status, now)?;
            append_history(conn, item_id, status, Some(details), now)?;
            Ok(())
        })
    }
}

/// Run the handler for `operation.operation_type`.
pub fn execute(
    env: &ActionEnv,
    operation: &Operation,
    token: &CancellationToken,
) -> VaultResult<ActionOutcome> {
    let run = OperationRun {
        env,
        operation_id: operation.id,
        token,
    };
    let params = &operation.parameters;
    match operation.operation_type {
        OperationKind::Protect => protect::protect(&run, params),
        OperationKind::Verify => verify::verify(&run, params),
        OperationKind::Repair => repair::repair(&run, params),
        OperationKind::Remove => remove::remove(&run, params),
    }
}

/// Look up the target item by `id`, else by `path` (narrowed by
/// `file_types` when several items share the path).
pub fn resolve_item(storage: &Storage, params: &OperationParams) -> VaultResult<ProtectedItem> {
    if let Some(id) = params.id {
        return storage
            .read(|conn| get_protected_item(conn, id))?
            .ok_or_else(|| VaultError::NotFound {
                entity: "protected_items",
                key: id.to_string(),
            });
    }
    let path = params
        .path
        .as_deref()
        .ok_or_else(|| VaultError::invalid_parameter("path", "", "path or id is required"))?;
    let wanted = params.file_types.as_deref().and_then(normalize_file_types);
    let candidates = storage.read(|conn| find_protected_items_by_path(conn, path))?;
    let chosen = match &wanted {
        Some(types) => candidates
            .into_iter()
            .find(|item| item.file_types.as_ref() == Some(types)),
        None => candidates.into_iter().next(),
    };
    chosen.ok_or_else(|| VaultError::NotFound {
        entity: "protected_items",
        key: path.display().to_string(),
    })
}

/// `-B` directory of an existing item.
#[must_use]
pub fn item_base(item: &ProtectedItem) -> PathBuf {
    item.parent_dir
        .clone()
        .unwrap_or_else(|| ParityLayout::base_dir(&item.mode, &item.path))
}

/// Per-file items recorded under an individual-mode parent.
pub fn children_of(storage: &Storage, item: &ProtectedItem) -> VaultResult<Vec<ProtectedItem>> {
    if !item.mode.is_individual() {
        return Ok(Vec::new());
    }
    storage.read(|conn| list_children(conn, item.id))
}

/// Parity sets currently on disk for an item. Index files that vanished
/// are left out.
pub fn existing_sets(item: &ProtectedItem, children: &[ProtectedItem]) -> VaultResult<Vec<ParitySet>> {
    if item.par2_path.is_file() {
        return Ok(vec![ParitySet::existing(item_base(item), &item.par2_path)]);
    }
    match &item.mode {
        ProtectionMode::IndividualFiles { .. } => Ok(children
            .iter()
            .filter(|child| child.par2_path.is_file())
            .map(|child| ParitySet::existing(item_base(child), &child.par2_path))
            .collect()),
        ProtectionMode::Directory => {
            let stem = ParityLayout::directory_stem(&item.path, item.file_types.as_deref())?;
            Ok(discover_index_files(&item.par2_path, &stem)?
                .into_iter()
                .map(|index| ParitySet::existing(item_base(item), index))
                .collect())
        }
        ProtectionMode::File => Ok(Vec::new()),
    }
}

/// ERROR history plus a failed outcome for an item whose parity is gone.
pub(crate) fn parity_missing(run: &OperationRun<'_>, item: &ProtectedItem) -> VaultResult<ActionOutcome> {
    let error = VaultError::ParityMissing {
        path: item.par2_path.clone(),
    };
    let message = error.to_string();
    run.record_status(item.id, ItemStatus::Error, &message)?;
    warn!(
        target: "parvault.processor",
        operation_id = run.operation_id,
        item_id = item.id,
        path = %item.par2_path.display(),
        "parity data missing"
    );
    Ok(ActionOutcome::Failed(json!({
        "item_id": item.id,
        "status": ItemStatus::Error.as_str(),
        "error": message,
        "code": error.code(),
    })))
}

/// Result payload for an error that ended an operation.
#[must_use]
pub fn error_result(error: &VaultError) -> Value {
    json!({
        "error": error.to_string(),
        "code": error.code(),
    })
}
