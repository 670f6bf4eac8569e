use parvault_core::{ItemStatus, OperationParams, VaultResult};
use parvault_durability::{ParitySet, classify_repair_run, reduce};
use serde_json::json;
use tracing::{info, warn};

use super::verify::{child_for, classification_payload};
use super::{ActionOutcome, OperationRun, children_of, existing_sets, parity_missing, resolve_item};

pub fn repair(run: &OperationRun<'_>, params: &OperationParams) -> VaultResult<ActionOutcome> {
    let item = resolve_item(&run.env.storage, params)?;
    let children = children_of(&run.env.storage, &item)?;
    let all_sets = existing_sets(&item, &children)?;
    if all_sets.is_empty() {
        return parity_missing(run, &item);
    }

    // Individual mode repairs only files whose last check was not clean,
    // unless every file looked healthy.
    let unhealthy: Vec<&ParitySet> = all_sets
        .iter()
        .filter(|set| {
            child_for(&children, &set.parity_file)
                .is_some_and(|child| !child.last_status.is_healthy())
        })
        .collect();
    let sets: Vec<&ParitySet> = if unhealthy.is_empty() {
        all_sets.iter().collect()
    } else {
        unhealthy
    };

    let builder = run.builder();
    let mut results = Vec::with_capacity(sets.len());
    for set in &sets {
        let outcome = run.run_par2(&builder.repair(set))?;
        let classification = classify_repair_run(&outcome.combined_output, outcome.exit_status);
        if let Some(child) = child_for(&children, &set.parity_file) {
            run.record_status(child.id, classification.status, &classification.details)?;
        }
        results.push((set.label.clone(), classification));
    }

    let reduced = reduce(&results);
    run.record_status(item.id, reduced.status, &reduced.details)?;

    if reduced.status != ItemStatus::Repaired {
        warn!(
            target: "parvault.processor",
            operation_id = run.operation_id,
            item_id = item.id,
            status = reduced.status.as_str(),
            "repair did not succeed"
        );
        return Ok(ActionOutcome::Failed(classification_payload(
            &item,
            &reduced,
            sets.len(),
            None,
        )));
    }

    let metadata = run.env.config.metadata.restore_after_repair.then(|| {
        match run.env.metadata.restore(item.id) {
            Ok(report) => json!(report),
            Err(error) => {
                warn!(
                    target: "parvault.processor",
                    operation_id = run.operation_id,
                    item_id = item.id,
                    error = %error,
                    "metadata restore after repair failed"
                );
                json!({ "error": error.to_string(), "code": error.code() })
            }
        }
    });

    info!(
        target: "parvault.processor",
        operation_id = run.operation_id,
        item_id = item.id,
        parity_sets = sets.len(),
        "item repaired"
    );
    Ok(ActionOutcome::Completed(classification_payload(
        &item,
        &reduced,
        sets.len(),
        metadata,
    )))
}
