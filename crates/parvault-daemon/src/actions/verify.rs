use parvault_core::{ItemStatus, OperationParams, VaultResult};
use parvault_durability::{CheckKind, Classification, classify, reduce};
use parvault_storage::ProtectedItem;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{ActionOutcome, OperationRun, children_of, existing_sets, parity_missing, resolve_item};

pub fn verify(run: &OperationRun<'_>, params: &OperationParams) -> VaultResult<ActionOutcome> {
    let item = resolve_item(&run.env.storage, params)?;
    let children = children_of(&run.env.storage, &item)?;
    let sets = existing_sets(&item, &children)?;
    if sets.is_empty() {
        return parity_missing(run, &item);
    }

    let builder = run.builder();
    let mut results = Vec::with_capacity(sets.len());
    for set in &sets {
        let outcome = run.run_par2(&builder.verify(set))?;
        let classification = classify(&outcome.combined_output, CheckKind::Verify);
        if let Some(child) = child_for(&children, &set.parity_file) {
            run.record_status(child.id, classification.status, &classification.details)?;
        }
        results.push((set.label.clone(), classification));
    }

    let reduced = reduce(&results);
    run.record_status(item.id, reduced.status, &reduced.details)?;

    let metadata = if params.verify_metadata || run.env.config.metadata.verify_on_verify {
        let auto_restore = params.auto_restore_metadata || run.env.config.metadata.auto_restore;
        Some(verify_metadata(run, &item, auto_restore))
    } else {
        None
    };

    info!(
        target: "parvault.processor",
        operation_id = run.operation_id,
        item_id = item.id,
        status = reduced.status.as_str(),
        parity_sets = sets.len(),
        "item verified"
    );

    let payload = classification_payload(&item, &reduced, sets.len(), metadata);
    // Damage is a finding; an unreadable or unrecognized result is not.
    if reduced.status == ItemStatus::Error {
        return Ok(ActionOutcome::Failed(payload));
    }
    Ok(ActionOutcome::Completed(payload))
}

fn verify_metadata(run: &OperationRun<'_>, item: &ProtectedItem, auto_restore: bool) -> Value {
    match run.env.metadata.verify(item.id, auto_restore) {
        Ok(report) => json!(report),
        Err(error) => {
            warn!(
                target: "parvault.processor",
                operation_id = run.operation_id,
                item_id = item.id,
                error = %error,
                "metadata verification failed"
            );
            json!({ "error": error.to_string(), "code": error.code() })
        }
    }
}

pub(super) fn child_for<'a>(
    children: &'a [ProtectedItem],
    parity_file: &std::path::Path,
) -> Option<&'a ProtectedItem> {
    children.iter().find(|child| child.par2_path == parity_file)
}

pub(super) fn classification_payload(
    item: &ProtectedItem,
    classification: &Classification,
    sets: usize,
    metadata: Option<Value>,
) -> Value {
    json!({
        "item_id": item.id,
        "path": item.path,
        "status": classification.status.as_str(),
        "details": classification.details,
        "damaged_targets": classification.damaged_targets,
        "missing_targets": classification.missing_targets,
        "blocks_needed": classification.blocks_needed,
        "parity_sets": sets,
        "metadata": metadata,
    })
}
