use std::path::PathBuf;
use std::time::Duration;

use parvault_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};

const MAX_ARGS_FLOOR: usize = 16;

/// How an oversized directory is split into independent parity sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStrategy {
    /// One set per immediate subdirectory, plus one for loose top-level files.
    BySubdirectory,
    /// Consecutive chunks of `batch_size` files.
    FixedSize,
}

/// par2 invocation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParityConfig {
    /// par2 executable (resolved through `PATH` when relative).
    pub binary: PathBuf,
    /// Directory created next to protected data to hold parity volumes.
    pub parity_dir_name: String,
    /// Redundancy percent when an operation does not specify one.
    pub default_redundancy: u8,
    /// CPU share handed to par2; drives `-t`.
    pub cpu_limit_percent: u8,
    /// `-m<MB>`.
    pub memory_limit_mb: Option<u64>,
    /// `-b<n>`; wins over `block_size`.
    pub block_count: Option<u32>,
    /// `-s<bytes>`.
    pub block_size: Option<u64>,
    /// `-rm<MB>`; replaces the percentage redundancy when set.
    pub target_size_mb: Option<u64>,
    /// `-n<n>`.
    pub recovery_file_count: Option<u32>,
    /// Keep par2 verbose on create (`-q` is omitted).
    pub debug: bool,
    /// Largest argument count passed to one par2 invocation.
    pub max_args: usize,
    pub batch_strategy: BatchStrategy,
    pub batch_size: usize,
    /// Wall-clock budget of a single par2 run; 0 disables the budget.
    pub max_runtime_secs: u64,
    /// Time between SIGTERM and SIGKILL.
    pub terminate_grace_ms: u64,
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("par2"),
            parity_dir_name: ".parity".to_owned(),
            default_redundancy: 10,
            cpu_limit_percent: 80,
            memory_limit_mb: None,
            block_count: None,
            block_size: None,
            target_size_mb: None,
            recovery_file_count: None,
            debug: false,
            max_args: 32_768,
            batch_strategy: BatchStrategy::BySubdirectory,
            batch_size: 1_000,
            max_runtime_secs: 6 * 60 * 60,
            terminate_grace_ms: 5_000,
        }
    }
}

impl ParityConfig {
    #[must_use]
    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }

    #[must_use]
    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    /// Validate user-provided configuration values.
    pub fn validate(&self) -> VaultResult<()> {
        if self.binary.as_os_str().is_empty() {
            return Err(invalid("parity.binary", "", "must name a par2 executable"));
        }
        if self.parity_dir_name.is_empty()
            || self.parity_dir_name.contains('/')
            || self.parity_dir_name == "."
            || self.parity_dir_name == ".."
        {
            return Err(invalid(
                "parity.parity_dir_name",
                &self.parity_dir_name,
                "must be a single directory name",
            ));
        }
        if !(1..=100).contains(&self.default_redundancy) {
            return Err(invalid(
                "parity.default_redundancy",
                &self.default_redundancy.to_string(),
                "must be between 1 and 100",
            ));
        }
        if !(1..=100).contains(&self.cpu_limit_percent) {
            return Err(invalid(
                "parity.cpu_limit_percent",
                &self.cpu_limit_percent.to_string(),
                "must be between 1 and 100",
            ));
        }
        if self.block_count == Some(0) {
            return Err(invalid("parity.block_count", "0", "must be greater than zero"));
        }
        if self.block_size.is_some_and(|size| size == 0 || size % 4 != 0) {
            return Err(invalid(
                "parity.block_size",
                &self.block_size.unwrap_or_default().to_string(),
                "must be a positive multiple of 4",
            ));
        }
        if self.max_args < MAX_ARGS_FLOOR {
            return Err(invalid(
                "parity.max_args",
                &self.max_args.to_string(),
                &format!("must be at least {MAX_ARGS_FLOOR}"),
            ));
        }
        if self.batch_size == 0 || self.batch_size >= self.max_args {
            return Err(invalid(
                "parity.batch_size",
                &self.batch_size.to_string(),
                "must be greater than zero and below max_args",
            ));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> VaultError {
    VaultError::InvalidConfig {
        field: field.to_owned(),
        value: value.to_owned(),
        reason: reason.to_owned(),
    }
}
