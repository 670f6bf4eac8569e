//! SQLite-backed persistent store for parvault.
//!
//! This crate owns schema bootstrap, protected item and verification history
//! persistence, per-file metadata rows and the durable operation queue.
#![allow(
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::uninlined_format_args
)]

pub mod connection;
pub mod file_metadata;
pub mod metrics;
pub mod operation_queue;
pub mod protected_items;
mod row;
pub mod schema;
pub mod verification_history;

pub use connection::{RetryPolicy, Storage, StorageConfig, is_busy, retry_on_busy};
pub use file_metadata::{FileMetadataRecord, list_file_metadata, replace_file_metadata};
pub use metrics::{QueueMetrics, QueueMetricsSnapshot, StorageMetrics, StorageMetricsSnapshot};
pub use operation_queue::{CancelOutcome, Operation, OperationQueue, QueueDepth, Transition};
pub use protected_items::{
    NewProtectedItem, ProtectedItem, delete_protected_item, find_protected_item,
    find_protected_items_by_path, get_protected_item, list_children, list_protected_items,
    redundancy_by_path, update_item_status, upsert_protected_item,
};
pub use schema::{SCHEMA_VERSION, bootstrap, current_version};
pub use verification_history::{
    VerificationRecord, append_history, count_history, history_for_item,
};
