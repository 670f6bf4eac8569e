//! Shared fixtures: a shell-script stand-in for par2 and a processor wired
//! to a scratch database.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parvault_daemon::{
    ActionEnv, LeaderElection, ProcessorOptions, QueueProcessor, ResourceMonitor,
    ResourceSampler, ShutdownCoordinator, VaultConfig,
};
use parvault_core::VaultResult;
use parvault_storage::{OperationQueue, Storage};
use tempfile::TempDir;

/// Behaves like par2 for the subcommands the processor issues. The mode
/// file next to the script selects the outcome: `ok`, `damaged`, `fail`
/// or `slow`.
const FAKE_PAR2: &str = r#"#!/bin/sh
dir=$(dirname "$0")
mode=$(cat "$dir/mode" 2>/dev/null || echo ok)
echo "$*" >> "$dir/calls.log"
cmd=$1
par=""
for arg in "$@"; do
  case "$arg" in
    -*) ;;
    *.par2) if [ -z "$par" ]; then par=$arg; fi ;;
  esac
done
case "$mode" in
  slow) exec sleep 30 ;;
  fail) echo "Error: could not create recovery file" >&2; exit 2 ;;
esac
case "$cmd" in
  c)
    mkdir -p "$(dirname "$par")"
    echo index > "$par"
    echo volume > "${par%.par2}.vol00+01.par2"
    echo "Done."
    ;;
  v)
    if [ "$mode" = damaged ]; then
      echo 'Target: "a.txt" - damaged. Found 95 of 100 data blocks.'
      echo "Repair is required."
      echo "Repair is possible."
      exit 1
    fi
    echo "All files are correct, repair is not required."
    ;;
  r)
    echo "Repair complete."
    ;;
esac
"#;

pub struct Fixture {
    pub dir: TempDir,
    pub script: PathBuf,
    pub config: VaultConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        fs::create_dir_all(&bin).unwrap();
        let script = bin.join("par2");
        fs::write(&script, FAKE_PAR2).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = VaultConfig::default();
        config.storage.db_path = dir.path().join("parvault.sqlite3").to_string_lossy().into_owned();
        config.parity.binary = script.clone();
        config.processor.pid_file = dir.path().join("processor.pid").to_string_lossy().into_owned();
        config.processor.poll_interval_ms = 20;
        config.metadata.capture_on_protect = false;
        Self { dir, script, config }
    }

    pub fn set_mode(&self, mode: &str) {
        fs::write(self.script.with_file_name("mode"), mode).unwrap();
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.script.with_file_name("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    /// `root/<name>` with the given files.
    pub fn data_dir(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let root = self.dir.path().join("data").join(name);
        for (relative, contents) in files {
            let path = root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        root
    }

    pub fn storage(&self) -> Arc<Storage> {
        Arc::new(Storage::open(self.config.storage.to_storage_config()).unwrap())
    }

    pub fn processor(&self, storage: &Arc<Storage>) -> QueueProcessor {
        let monitor = ResourceMonitor::new(&self.config.resources, Box::new(IdleHost));
        let env = ActionEnv::new(Arc::clone(storage), Arc::new(self.config.clone()), 2);
        QueueProcessor::new(
            env,
            monitor,
            Box::new(StaticLeader),
            Arc::new(ShutdownCoordinator::new()),
            ProcessorOptions::from_config(&self.config, true),
        )
    }
}

/// Tick and wait until nothing is pending or processing.
pub fn run_until_idle(processor: &mut QueueProcessor, queue: &OperationQueue) {
    for _ in 0..50 {
        processor.tick();
        processor.drain();
        if queue.queue_depth().unwrap().active() == 0 {
            return;
        }
    }
    panic!("queue did not drain");
}

pub fn write_file(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

struct IdleHost;

impl ResourceSampler for IdleHost {
    fn cpu_percent(&mut self) -> f64 {
        5.0
    }

    fn memory_percent(&mut self) -> f64 {
        20.0
    }

    fn io_bytes(&mut self) -> Option<u64> {
        None
    }

    fn core_count(&self) -> usize {
        2
    }
}

struct StaticLeader;

impl LeaderElection for StaticLeader {
    fn try_acquire(&mut self) -> VaultResult<()> {
        Ok(())
    }

    fn release(&mut self) {}

    fn is_leader(&self) -> bool {
        true
    }

    fn leader_pid(&self) -> Option<u32> {
        Some(std::process::id())
    }
}
