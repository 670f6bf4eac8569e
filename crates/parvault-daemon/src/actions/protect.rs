//! Create parity for a file, a directory tree or a category of files.

use std::fs;
use std::path::{Path, PathBuf};

use parvault_core::{
    FileEnumerator, ItemStatus, OperationParams, ProtectionMode, VaultError, VaultResult,
    normalize_file_types, unix_timestamp_ms,
};
use parvault_durability::{ParitySet, is_acceptable_warning, parity_files_of};
use parvault_storage::{NewProtectedItem, append_history, upsert_protected_item};
use serde_json::json;
use tracing::{info, warn};

use super::{ActionOutcome, OperationRun};

/// What a protect run resolved the request to.
#[derive(Debug)]
struct ProtectPlan {
    mode: ProtectionMode,
    file_types: Option<Vec<String>>,
    files: Vec<PathBuf>,
    total_bytes: u64,
    sets: Vec<ParitySet>,
}

pub fn protect(run: &OperationRun<'_>, params: &OperationParams) -> VaultResult<ActionOutcome> {
    let path = params
        .path
        .clone()
        .ok_or_else(|| VaultError::invalid_parameter("path", "", "protect requires a path"))?;
    if !path.exists() {
        return Err(VaultError::PathNotFound { path });
    }
    let config = &run.env.config;
    let redundancy = params.redundancy.unwrap_or(config.parity.default_redundancy);

    let Some(plan) = plan(run, &path, params)? else {
        return Ok(ActionOutcome::Skipped(json!({
            "path": path,
            "reason": "no matching files to protect",
        })));
    };

    let existing: Vec<&ParitySet> = plan
        .sets
        .iter()
        .filter(|set| set.parity_file.exists())
        .collect();
    if !params.force && !existing.is_empty() && existing.len() == plan.sets.len() {
        return Ok(ActionOutcome::Skipped(json!({
            "path": path,
            "reason": "parity already exists",
            "parity_sets": plan.sets.len(),
        })));
    }
    for set in &existing {
        remove_parity_set(set)?;
    }

    let builder = run.builder();
    let mut succeeded = Vec::new();
    let mut failures = Vec::new();
    for set in &plan.sets {
        if let Some(parent) = set.parity_file.parent() {
            fs::create_dir_all(parent)?;
        }
        let command = builder.create(set, redundancy);
        let outcome = run.run_par2(&command)?;
        if outcome.success || is_acceptable_warning(&outcome.combined_output) {
            succeeded.push(set);
        } else {
            warn!(
                target: "parvault.processor",
                operation_id = run.operation_id,
                set = %set.label,
                exit_status = ?outcome.exit_status,
                "par2 create failed"
            );
            failures.push(json!({
                "set": set.label,
                "exit_status": outcome.exit_status,
                "output": tail(&outcome.combined_output),
            }));
        }
    }

    // Directory batches form one item: any failed batch fails it. Individual
    // files stand alone, so the item keeps whatever succeeded.
    let partial_ok = plan.mode.is_individual() && !succeeded.is_empty();
    if !failures.is_empty() && !partial_ok {
        let error = VaultError::ToolExecution {
            subcommand: "c".to_owned(),
            exit_status: None,
            detail: format!("{} of {} parity sets failed", failures.len(), plan.sets.len()),
        };
        return Ok(ActionOutcome::Failed(json!({
            "path": path,
            "error": error.to_string(),
            "code": error.code(),
            "succeeded": succeeded.len(),
            "failed": failures.len(),
            "failures": failures,
        })));
    }

    let item_id = record(run, &path, &plan, &succeeded, redundancy)?;

    let metadata_captured = if params.capture_metadata || config.metadata.capture_on_protect {
        match run.env.metadata.capture(&path, item_id) {
            Ok(captured) => Some(captured),
            Err(error) => {
                warn!(
                    target: "parvault.processor",
                    operation_id = run.operation_id,
                    item_id,
                    error = %error,
                    "metadata capture failed"
                );
                None
            }
        }
    } else {
        None
    };

    info!(
        target: "parvault.processor",
        operation_id = run.operation_id,
        item_id,
        path = %path.display(),
        mode = %plan.mode,
        parity_sets = succeeded.len(),
        "item protected"
    );
    Ok(ActionOutcome::Completed(json!({
        "item_id": item_id,
        "path": path,
        "mode": plan.mode.to_db_string(),
        "redundancy": redundancy,
        "files": plan.files.len(),
        "size": plan.total_bytes,
        "parity_sets": succeeded.len(),
        "failed": failures.len(),
        "failures": failures,
        "metadata_captured": metadata_captured,
    })))
}

/// Resolve mode, files and parity sets. `None` when nothing matches.
fn plan(
    run: &OperationRun<'_>,
    path: &Path,
    params: &OperationParams,
) -> VaultResult<Option<ProtectPlan>> {
    let config = &run.env.config;
    let layout = run.layout();

    if path.is_file() {
        if params.category.is_some() {
            return Err(VaultError::invalid_parameter(
                "category",
                path.display().to_string(),
                "individual-files protection needs a directory",
            ));
        }
        let size = fs::metadata(path)?.len();
        return Ok(Some(ProtectPlan {
            mode: ProtectionMode::File,
            file_types: None,
            files: vec![path.to_path_buf()],
            total_bytes: size,
            sets: vec![layout.plan_file(path)?],
        }));
    }

    let (mode, file_types) = match &params.category {
        Some(category) => {
            let types = params
                .file_types
                .as_deref()
                .and_then(normalize_file_types)
                .or_else(|| config.category_extensions(category).map(<[String]>::to_vec))
                .ok_or_else(|| {
                    VaultError::invalid_parameter(
                        "category",
                        category.clone(),
                        "unknown category and no file_types given",
                    )
                })?;
            (
                ProtectionMode::IndividualFiles {
                    category: category.clone(),
                },
                Some(types),
            )
        }
        None => (
            ProtectionMode::Directory,
            params.file_types.as_deref().and_then(normalize_file_types),
        ),
    };

    let summary = FileEnumerator::new(path)
        .exclude_dir_name(layout.parity_dir_name())
        .with_extensions(file_types.as_deref())
        .summarize()?;
    if summary.files.is_empty() {
        return Ok(None);
    }

    let sets = match &mode {
        ProtectionMode::IndividualFiles { category } => {
            layout.plan_individual(path, category, &summary.files)?
        }
        _ => layout.plan_directory(path, file_types.as_deref(), summary.files.clone())?,
    };
    Ok(Some(ProtectPlan {
        mode,
        file_types,
        files: summary.files,
        total_bytes: summary.total_bytes,
        sets,
    }))
}

/// Upsert the item (plus per-file children in individual mode) and its
/// first history row.
fn record(
    run: &OperationRun<'_>,
    path: &Path,
    plan: &ProtectPlan,
    succeeded: &[&ParitySet],
    redundancy: u8,
) -> VaultResult<i64> {
    let layout = run.layout();
    let par2_size = succeeded
        .iter()
        .map(|set| parity_bytes(&set.parity_file))
        .sum::<VaultResult<u64>>()?;

    let (protected_files, data_size) = if plan.mode.is_individual() {
        let files: Vec<PathBuf> = succeeded
            .iter()
            .flat_map(|set| set.files.iter().cloned())
            .collect();
        let bytes = files
            .iter()
            .map(|file| fs::metadata(file).map(|meta| meta.len()))
            .sum::<std::io::Result<u64>>()?;
        (files, bytes)
    } else {
        (plan.files.clone(), plan.total_bytes)
    };

    let par2_path = match (&plan.mode, succeeded) {
        (ProtectionMode::IndividualFiles { .. }, _) => layout.parity_dir(&plan.mode, path),
        (_, [single]) => single.parity_file.clone(),
        _ => layout.parity_dir(&plan.mode, path),
    };
    let item = NewProtectedItem {
        path: path.to_path_buf(),
        mode: plan.mode.clone(),
        redundancy,
        size: plan.total_bytes,
        data_size,
        par2_size,
        par2_path,
        file_types: plan.file_types.clone(),
        parent_dir: None,
        protected_files: Some(protected_files),
        parent_item_id: None,
    };

    let mut children = Vec::new();
    if plan.mode.is_individual() {
        for set in succeeded {
            let Some(file) = set.files.first() else {
                continue;
            };
            let size = fs::metadata(file)?.len();
            children.push(NewProtectedItem {
                path: file.clone(),
                mode: ProtectionMode::File,
                redundancy,
                size,
                data_size: size,
                par2_size: parity_bytes(&set.parity_file)?,
                par2_path: set.parity_file.clone(),
                file_types: None,
                parent_dir: Some(path.to_path_buf()),
                protected_files: None,
                // Filled in once the parent row has an id.
                parent_item_id: None,
            });
        }
    }

    let now = unix_timestamp_ms()?;
    let details = format!(
        "Protected {} files in {} parity sets",
        item.protected_files.as_ref().map_or(0, Vec::len),
        succeeded.len()
    );
    run.env.storage.transaction(|conn| {
        let item_id = upsert_protected_item(conn, &item, now)?;
        append_history(conn, item_id, ItemStatus::Protected, Some(&details), now)?;
        for child in &children {
            let child = NewProtectedItem {
                parent_item_id: Some(item_id),
                ..child.clone()
            };
            let child_id = upsert_protected_item(conn, &child, now)?;
            append_history(conn, child_id, ItemStatus::Protected, Some("Protected"), now)?;
        }
        Ok(item_id)
    })
}

fn parity_bytes(index_file: &Path) -> VaultResult<u64> {
    parity_files_of(index_file)?
        .iter()
        .map(|file| fs::metadata(file).map(|meta| meta.len()).map_err(VaultError::from))
        .sum()
}

/// Delete a set's index and volumes so `par2 c` can write them afresh.
fn remove_parity_set(set: &ParitySet) -> VaultResult<()> {
    for file in parity_files_of(&set.parity_file)? {
        fs::remove_file(&file)?;
    }
    Ok(())
}

fn tail(output: &str) -> String {
    const MAX: usize = 2_000;
    if output.len() <= MAX {
        return output.to_owned();
    }
    let mut start = output.len() - MAX;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    output[start..].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_the_end_on_a_char_boundary() {
        let long = format!("{}é{}", "a".repeat(10), "b".repeat(1_999));
        let kept = tail(&long);
        assert!(kept.len() <= 2_000);
        assert!(kept.ends_with('b'));
        assert_eq!(tail("short"), "short");
    }
}
