//! Command builder, runner and classifier together against a scripted par2.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use parvault_core::ItemStatus;
use parvault_durability::{
    CancellationToken, CheckKind, CommandBuilder, Par2Runner, ParityConfig, ParityLayout, classify,
    classify_repair_run,
};

fn script(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("par2");
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config(binary: PathBuf) -> ParityConfig {
    ParityConfig {
        binary,
        terminate_grace_ms: 200,
        ..ParityConfig::default()
    }
}

#[test]
fn verify_output_flows_into_classification() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("a.txt");
    fs::write(&data, "alpha").unwrap();
    let binary = script(
        dir.path(),
        r#"echo 'Target: "a.txt" - missing.' >&2; echo "Repair is required."; exit 1"#,
    );
    let config = config(binary);

    let set = ParityLayout::new(&config).plan_file(&data).unwrap();
    let command = CommandBuilder::new(&config, 4).verify(&set);
    let mut recorded = None;
    let outcome = Par2Runner::from_config(&config)
        .run(&command, 1, &CancellationToken::new(), |pid| recorded = Some(pid))
        .unwrap();

    assert_eq!(recorded, Some(outcome.pid));
    assert!(!outcome.success);
    assert_eq!(outcome.exit_status, Some(1));
    let classification = classify(&outcome.combined_output, CheckKind::Verify);
    assert_eq!(classification.status, ItemStatus::Missing);
    assert_eq!(classification.missing_targets, vec!["a.txt"]);
}

#[test]
fn arguments_reach_the_binary_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("b.bin");
    fs::write(&data, "beta").unwrap();
    let log = dir.path().join("args.log");
    let binary = script(
        dir.path(),
        &format!("printf '%s\\n' \"$@\" > {:?}; echo 'Repair complete.'", log),
    );
    let config = config(binary);

    let set = ParityLayout::new(&config).plan_file(&data).unwrap();
    let command = CommandBuilder::new(&config, 4).repair(&set);
    let outcome = Par2Runner::from_config(&config)
        .run(&command, 2, &CancellationToken::new(), |_| {})
        .unwrap();
    assert_eq!(
        classify_repair_run(&outcome.combined_output, outcome.exit_status).status,
        ItemStatus::Repaired
    );

    let args: Vec<String> = fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(str::to_owned)
        .collect();
    assert_eq!(args.first().map(String::as_str), Some("r"));
    assert_eq!(args[1], format!("-B{}", dir.path().display()));
    assert_eq!(args.last(), Some(&set.parity_file.display().to_string()));
}
