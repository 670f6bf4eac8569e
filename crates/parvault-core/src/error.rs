use std::path::PathBuf;

/// Unified error type covering every failure mode of the parvault orchestration engine.
///
/// Variants are grouped by the layer that raises them. Validation errors are
/// returned synchronously from enqueue; everything raised while an operation
/// is being processed is captured into the operation's `result` column by the
/// queue processor and never escapes the processing loop.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    // === Storage errors ===
    /// The database stayed locked after every retry attempt.
    #[error(
        "Database is locked after {attempts} attempts ({waited_ms}ms of backoff). Another writer holds the lock; retry later or raise storage.retry.max_retries."
    )]
    StorageLocked {
        /// Number of retries performed before giving up.
        attempts: u32,
        /// Cumulative backoff slept across the retries.
        waited_ms: u64,
    },

    // === Validation errors ===
    /// An operation parameter is missing or malformed.
    #[error("Invalid parameter {field} = \"{value}\": {reason}")]
    InvalidParameter {
        /// Parameter name.
        field: String,
        /// The offending value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The path to protect or verify does not exist.
    #[error("Path not found: {path}. Check the path is mounted and spelled correctly.")]
    PathNotFound {
        /// The missing path.
        path: PathBuf,
    },

    /// No parity data exists for an item that should be protected.
    #[error("Parity data missing at {path}. Re-protect the item to regenerate recovery volumes.")]
    ParityMissing {
        /// Expected parity file or directory.
        path: PathBuf,
    },

    /// A row looked up by key does not exist.
    #[error("{entity} not found for key {key:?}")]
    NotFound {
        /// Table or entity name.
        entity: &'static str,
        /// Lookup key.
        key: String,
    },

    /// A state transition raced with another writer.
    #[error("Conflict: {message}")]
    Conflict {
        /// What conflicted.
        message: String,
    },

    // === Tool execution errors ===
    /// The parity binary could not be started.
    #[error("Failed to spawn {binary}: {source}. Check parity.binary points at an executable par2.")]
    ToolSpawn {
        /// Binary that was attempted.
        binary: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The parity tool ran but reported failure.
    #[error("par2 {subcommand} failed (exit status {exit_status:?}): {detail}")]
    ToolExecution {
        /// Subcommand that was run (`c`, `v`, `r`).
        subcommand: String,
        /// Exit status, `None` when killed by a signal.
        exit_status: Option<i32>,
        /// Condensed output or reason.
        detail: String,
    },

    /// The parity tool exceeded its wall-clock budget and was killed.
    #[error(
        "par2 ran for {elapsed_ms}ms, exceeding its {budget_ms}ms budget. The run was killed and must be investigated; it is not restarted automatically."
    )]
    ToolTimeout {
        /// How long the tool ran.
        elapsed_ms: u64,
        /// The configured budget.
        budget_ms: u64,
    },

    /// The operation was cancelled while its subprocess was running.
    #[error("Operation {operation_id} was cancelled")]
    Cancelled {
        /// Queue entry id.
        operation_id: i64,
    },

    // === Classification ===
    /// Tool output matched none of the known patterns.
    #[error("Unrecognized par2 {kind} output: {excerpt}")]
    ClassificationUnknown {
        /// Operation kind that produced the output.
        kind: String,
        /// Leading slice of the raw output.
        excerpt: String,
    },

    // === Metadata ===
    /// One or more metadata restore actions failed (usually privilege).
    #[error("Metadata restore partially failed: {failed} of {attempted} actions failed ({detail})")]
    MetadataPartialFailure {
        /// Failed actions.
        failed: usize,
        /// Attempted actions.
        attempted: usize,
        /// First failure messages.
        detail: String,
    },

    // === Admission ===
    /// Resource admission was denied; the operation stays pending.
    #[error("Resources unavailable: {}", reasons.join("; "))]
    ResourceUnavailable {
        /// Every exceeded dimension.
        reasons: Vec<String>,
    },

    /// Another live processor already holds the election lock.
    #[error("Queue processor already running (PID {pid}). Only one processor may run per host.")]
    ProcessorAlreadyRunning {
        /// PID recorded in the lock file.
        pid: u32,
    },

    // === Configuration errors ===
    /// A configuration value is invalid.
    #[error("Invalid config: {field} = \"{value}\": {reason}")]
    InvalidConfig {
        /// Which config field.
        field: String,
        /// The invalid value.
        value: String,
        /// Why it is invalid.
        reason: String,
    },

    // === I/O errors ===
    /// Wraps `std::io::Error` for file operations.
    #[error("I/O error: {0}. Check file permissions and disk space.")]
    Io(#[from] std::io::Error),

    // === Subsystem errors ===
    /// Wraps errors from subsystems (storage, serialization, signals).
    #[error("{subsystem} error: {source}")]
    SubsystemError {
        /// Which subsystem produced the error (e.g. "storage", "queue").
        subsystem: &'static str,
        /// The underlying error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl VaultError {
    /// Whether the error belongs to the validation class that is rejected
    /// before any subprocess is spawned.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter { .. }
                | Self::PathNotFound { .. }
                | Self::ParityMissing { .. }
                | Self::NotFound { .. }
        )
    }

    /// Stable machine-readable code written into operation results.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::StorageLocked { .. } => "storage_locked",
            Self::InvalidParameter { .. } => "invalid_parameter",
            Self::PathNotFound { .. } => "path_not_found",
            Self::ParityMissing { .. } => "parity_missing",
            Self::NotFound { .. } => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::ToolSpawn { .. } => "tool_spawn",
            Self::ToolExecution { .. } => "tool_execution",
            Self::ToolTimeout { .. } => "tool_timeout",
            Self::Cancelled { .. } => "cancelled",
            Self::ClassificationUnknown { .. } => "classification_unknown",
            Self::MetadataPartialFailure { .. } => "metadata_partial_failure",
            Self::ResourceUnavailable { .. } => "resource_unavailable",
            Self::ProcessorAlreadyRunning { .. } => "processor_running",
            Self::InvalidConfig { .. } => "invalid_config",
            Self::Io(_) => "io",
            Self::SubsystemError { .. } => "subsystem",
        }
    }

    pub fn invalid_parameter(
        field: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience alias used throughout the parvault crate hierarchy.
pub type VaultResult<T> = Result<T, VaultError>;
