//! Drop protection: parity files on disk, then the item rows.
//!
//! Only files with the parity extension are deleted, and the parity
//! directory is removed only when nothing else is left in it.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parvault_core::{OperationParams, VaultResult};
use parvault_durability::{is_parity_file, parity_files_of};
use parvault_storage::delete_protected_item;
use serde_json::json;
use tracing::{debug, info};

use super::{ActionOutcome, OperationRun, children_of, existing_sets, resolve_item};

pub fn remove(run: &OperationRun<'_>, params: &OperationParams) -> VaultResult<ActionOutcome> {
    let item = resolve_item(&run.env.storage, params)?;
    let children = children_of(&run.env.storage, &item)?;

    let mut deleted: Vec<PathBuf> = Vec::new();
    let mut parity_dir_removed = false;
    if params.delete_parity() {
        for set in existing_sets(&item, &children)? {
            for file in parity_files_of(&set.parity_file)? {
                if delete_parity_file(&file)? {
                    deleted.push(file);
                }
            }
        }
        let parity_dir = if item.par2_path.is_dir() {
            Some(item.par2_path.clone())
        } else {
            item.par2_path.parent().map(Path::to_path_buf)
        };
        if let Some(dir) = parity_dir {
            parity_dir_removed = remove_dir_if_empty(&dir)?;
        }
    }

    run.env.storage.transaction(|conn| {
        for child in &children {
            delete_protected_item(conn, child.id)?;
        }
        delete_protected_item(conn, item.id)?;
        Ok(())
    })?;

    info!(
        target: "parvault.processor",
        operation_id = run.operation_id,
        item_id = item.id,
        path = %item.path.display(),
        deleted_files = deleted.len(),
        parity_dir_removed,
        "protection removed"
    );
    Ok(ActionOutcome::Completed(json!({
        "item_id": item.id,
        "path": item.path,
        "removed_items": children.len() + 1,
        "deleted_files": deleted,
        "parity_dir_removed": parity_dir_removed,
    })))
}

fn delete_parity_file(file: &Path) -> VaultResult<bool> {
    if !is_parity_file(file) {
        return Ok(false);
    }
    match fs::remove_file(file) {
        Ok(()) => Ok(true),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
        Err(error) => Err(error.into()),
    }
}

fn remove_dir_if_empty(dir: &Path) -> VaultResult<bool> {
    if !dir.is_dir() || fs::read_dir(dir)?.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(dir)?;
    debug!(target: "parvault.processor", path = %dir.display(), "empty parity directory removed");
    Ok(true)
}
