//! Core types and error taxonomy for the parvault parity orchestration engine.
//!
//! This crate defines the shared error type (`VaultError`), the domain enums
//! (protection mode, item status, queue state machine), typed operation
//! parameters and the recursive file enumerator used across all parvault
//! crates. It is depended on by every other crate in the workspace.

pub mod enumerate;
pub mod error;
pub mod tracing_config;
pub mod types;

pub use enumerate::{EnumeratedFile, EnumerationSummary, FileEnumerator};
pub use error::{VaultError, VaultResult};
pub use types::{
    ItemStatus, MetadataStatus, OperationKind, OperationParams, OperationStatus, ProtectionMode,
    normalize_file_types, unix_timestamp_ms,
};
