//! Queue behavior seen through the facade: runtime commands, terminal
//! transitions and recovery after a dead processor.

use parvault::daemon::CliCommand;
use parvault::storage::Transition;
use parvault::{
    OperationKind, OperationParams, OperationStatus, ProcessorLauncher, VaultConfig, VaultRuntime,
};
use serde_json::json;

fn runtime(dir: &tempfile::TempDir) -> VaultRuntime {
    let mut config = VaultConfig::default();
    config.storage.db_path = dir.path().join("vault.sqlite3").to_string_lossy().into_owned();
    config.processor.pid_file = dir.path().join("processor.pid").to_string_lossy().into_owned();
    let launcher = ProcessorLauncher::disabled(&config.processor.pid_file);
    VaultRuntime::open(config, launcher).expect("runtime opens")
}

#[test]
fn runtime_commands_share_one_queue() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime(&dir);

    let receipt = runtime
        .execute(&CliCommand::Enqueue {
            kind: OperationKind::Protect,
            params: OperationParams::for_path("/mnt/user/photos"),
        })
        .expect("enqueue");
    assert_eq!(receipt["success"], true);
    assert_eq!(receipt["processor"]["state"], "disabled");
    let id = receipt["operation_id"].as_i64().expect("id");

    let listed = runtime
        .execute(&CliCommand::List {
            active: true,
            limit: 10,
        })
        .expect("list");
    assert_eq!(listed["depth"]["pending"], 1);
    assert_eq!(listed["operations"][0]["id"], id);

    let by_path = runtime
        .execute(&CliCommand::Items {
            path: Some("/mnt/user/photos".into()),
        })
        .expect("items");
    assert_eq!(by_path["items"], json!([]));
    assert_eq!(by_path["operations"].as_array().map(Vec::len), Some(1));

    runtime
        .execute(&CliCommand::Cancel { operation_id: id })
        .expect("cancel");
    let status = runtime
        .execute(&CliCommand::Status { operation_id: id })
        .expect("status");
    assert_eq!(status["status"], "cancelled");
}

#[test]
fn cancelled_rows_are_never_overwritten() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime(&dir);
    let queue = runtime.service().queue();

    let id = queue
        .enqueue(OperationKind::Repair, &OperationParams::for_id(3))
        .expect("enqueue");
    let claimed = queue.claim_next(std::process::id(), 2).expect("claim").expect("row");
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.status, OperationStatus::Processing);

    let cancel = queue.cancel(id).expect("cancel");
    assert_eq!(cancel.previous, OperationStatus::Processing);

    let late = queue.complete(id, &json!({"status": "REPAIRED"})).expect("complete");
    assert_eq!(
        late,
        Transition::Superseded {
            current: OperationStatus::Cancelled
        }
    );
    let row = queue.get(id).expect("get").expect("row");
    assert_eq!(row.status, OperationStatus::Cancelled);
    assert!(row.completed_at.is_some());
}

#[test]
fn orphaned_rows_fail_and_old_rows_are_purged() {
    let dir = tempfile::tempdir().expect("tempdir");
    let runtime = runtime(&dir);
    let queue = runtime.service().queue();

    let orphan = queue
        .enqueue(OperationKind::Verify, &OperationParams::for_path("/a"))
        .expect("enqueue");
    let done = queue
        .enqueue(OperationKind::Verify, &OperationParams::for_path("/b"))
        .expect("enqueue");
    queue.claim_next(41, 4).expect("claim");
    queue.claim_next(42, 4).expect("claim");
    queue.complete(done, &json!({})).expect("complete");

    let reconciled = queue.reconcile_orphans(|_, pid| pid == Some(42)).expect("reconcile");
    assert_eq!(reconciled, 1);
    let row = queue.get(orphan).expect("get").expect("row");
    assert_eq!(row.status, OperationStatus::Failed);
    assert_eq!(row.result.expect("result")["code"], "orphaned");

    let purged = queue.purge_terminal_before(i64::MAX).expect("purge");
    assert_eq!(purged, 2);
    assert!(queue.recent(10).expect("recent").is_empty());
}
