use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn parvault(config: &Path, args: &[&str]) -> (i32, Value) {
    let output: Output = Command::new(env!("CARGO_BIN_EXE_parvault"))
        .args(args)
        .arg("--config")
        .arg(config)
        .env_remove("PARVAULT_LOG")
        .env_remove("RUST_LOG")
        .env("PARVAULT_LOG_LEVEL", "error")
        .output()
        .unwrap();
    let envelope: Value = serde_json::from_slice(&output.stdout).unwrap_or_else(|error| {
        panic!(
            "stdout is not JSON ({error}): {}",
            String::from_utf8_lossy(&output.stdout)
        )
    });
    (output.status.code().unwrap(), envelope)
}

/// Config whose lock file names this (live) test process, so enqueues never
/// launch a background processor.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let pid_file = dir.join("processor.pid");
    fs::write(
        &pid_file,
        serde_json::json!({
            "pid": std::process::id(),
            "started_at_ms": 0,
            "hostname": "test-host",
            "version": "0.0.0",
        })
        .to_string(),
    )
    .unwrap();
    let config = dir.join("config.toml");
    fs::write(
        &config,
        format!(
            "[storage]\ndb_path = {:?}\n\n[processor]\npid_file = {:?}\n",
            dir.join("vault.sqlite3"),
            pid_file,
        ),
    )
    .unwrap();
    config
}

#[test]
fn enqueue_status_list_and_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let (code, enqueued) = parvault(&config, &["enqueue", "verify", "--path", "/mnt/user/media"]);
    assert_eq!(code, 0, "{enqueued}");
    assert_eq!(enqueued["ok"], true);
    assert_eq!(enqueued["data"]["success"], true);
    assert_eq!(enqueued["data"]["processor"]["state"], "already_running");
    let id = enqueued["data"]["operation_id"].as_i64().unwrap();

    let (code, status) = parvault(&config, &["status", &id.to_string()]);
    assert_eq!(code, 0);
    assert_eq!(status["data"]["status"], "pending");
    assert_eq!(status["data"]["operation_type"], "verify");

    let (_, listed) = parvault(&config, &["list", "--active"]);
    assert_eq!(listed["data"]["depth"]["pending"], 1);
    assert_eq!(listed["data"]["operations"].as_array().unwrap().len(), 1);

    let (code, cancelled) = parvault(&config, &["cancel", &id.to_string()]);
    assert_eq!(code, 0);
    assert_eq!(cancelled["data"]["previous_status"], "pending");

    let (code, again) = parvault(&config, &["cancel", &id.to_string()]);
    assert_eq!(code, 1);
    assert_eq!(again["error"]["code"], "conflict");
}

#[test]
fn validation_and_usage_errors_have_distinct_exit_codes() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let (code, envelope) = parvault(&config, &["enqueue", "repair"]);
    assert_eq!(code, 1);
    assert_eq!(envelope["error"]["code"], "invalid_parameter");

    let (code, envelope) = parvault(&config, &["list", "--bogus"]);
    assert_eq!(code, 2);
    assert_eq!(envelope["ok"], false);
    assert_eq!(envelope["error"]["code"], "invalid_config");

    let (code, envelope) = parvault(&config, &["history", "99"]);
    assert_eq!(code, 1);
    assert_eq!(envelope["error"]["code"], "not_found");
}

#[test]
fn run_refuses_while_another_processor_holds_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let (code, envelope) = parvault(&config, &["run"]);
    assert_eq!(code, 3, "{envelope}");
    assert_eq!(envelope["error"]["code"], "processor_running");
}

#[test]
fn items_is_empty_on_a_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    let (code, envelope) = parvault(&config, &["items"]);
    assert_eq!(code, 0);
    assert_eq!(envelope["data"]["items"], serde_json::json!([]));
}
