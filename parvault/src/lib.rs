//! # parvault
//!
//! Parity-based protection for files and directory trees on a NAS-style host.
//! Requests to protect, verify, repair or remove protection are written to a
//! durable SQLite queue and drained by a single background processor that
//! drives the external `par2` tool, classifies its output and records the
//! outcome per protected item.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use parvault::prelude::*;
//!
//! # fn main() -> VaultResult<()> {
//! let storage = Arc::new(Storage::open(StorageConfig::default())?);
//! let service = QueueService::new(
//!     storage,
//!     ProcessorLauncher::current_exe(default_pid_file(), Vec::new())?,
//!     Duration::from_secs(5),
//! );
//! let receipt = service.add_operation(
//!     OperationKind::Protect,
//!     &OperationParams::for_path("/mnt/user/photos"),
//! )?;
//! println!("queued operation {}", receipt.operation_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Crates
//!
//! | Crate | Contents |
//! |-------|----------|
//! | `parvault-core` | Error type, shared enums, operation parameters, file enumeration |
//! | `parvault-storage` | Schema, protected items, history, metadata rows, operation queue |
//! | `parvault-durability` | par2 commands, subprocess runner, output classifier, metadata manager |
//! | `parvault-daemon` | Queue processor, resource monitor, election, config, CLI |

/// Error type, enums and request parameters.
pub use parvault_core as core;
/// Persistence and the operation queue.
pub use parvault_storage as storage;
/// par2 invocation, classification and file metadata.
pub use parvault_durability as durability;

#[cfg(feature = "daemon")]
/// Processor, monitoring, configuration and CLI.
pub use parvault_daemon as daemon;

// ─── Core ───────────────────────────────────────────────────────────────────

pub use parvault_core::{
    FileEnumerator, ItemStatus, MetadataStatus, OperationKind, OperationParams, OperationStatus,
    ProtectionMode, VaultError, VaultResult,
};

// ─── Storage ────────────────────────────────────────────────────────────────

pub use parvault_storage::{
    Operation, OperationQueue, ProtectedItem, QueueDepth, Storage, StorageConfig,
    VerificationRecord,
};

// ─── Durability ─────────────────────────────────────────────────────────────

pub use parvault_durability::{
    CancellationToken, Classification, CommandBuilder, MetadataManager, Par2Runner, ParityConfig,
    ParityLayout, classify, classify_repair_run,
};

// ─── Daemon ─────────────────────────────────────────────────────────────────

#[cfg(feature = "daemon")]
pub use parvault_daemon::{
    ProcessorLauncher, QueueProcessor, QueueService, ResourceMonitor, VaultConfig, VaultRuntime,
    default_pid_file,
};

/// Common imports for embedding parvault.
pub mod prelude {
    pub use parvault_core::{
        ItemStatus, OperationKind, OperationParams, OperationStatus, ProtectionMode, VaultError,
        VaultResult,
    };
    pub use parvault_storage::{Operation, OperationQueue, ProtectedItem, Storage, StorageConfig};

    #[cfg(feature = "daemon")]
    pub use parvault_daemon::{
        ProcessorLauncher, QueueService, VaultConfig, VaultRuntime, default_pid_file,
    };
}
