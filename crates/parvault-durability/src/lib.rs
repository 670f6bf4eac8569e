//! Parity durability layer for parvault.
//!
//! - [`command`]: par2 command lines and the `.parity` directory layout.
//! - [`process`]: subprocess execution with cancellation and a runtime budget.
//! - [`classify`]: par2 output to [`parvault_core::ItemStatus`].
//! - [`metadata`]: ownership/permission/xattr capture, verification and restore.
#![allow(
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod classify;
pub mod command;
pub mod config;
pub mod metadata;
pub mod process;

pub use classify::{
    ACCEPTABLE_WARNINGS, CheckKind, Classification, classify, classify_repair_run,
    is_acceptable_warning, reduce,
};
pub use command::{
    CommandBuilder, Par2Command, Par2Subcommand, ParityLayout, ParitySet, discover_index_files,
    is_parity_file, parity_files_of,
};
pub use config::{BatchStrategy, ParityConfig};
pub use metadata::{MetadataDifference, MetadataManager, MetadataReport, RestoreReport, read_record};
pub use process::{
    CancellationToken, Par2Runner, ProcessOutcome, RunEnd, RunOptions, is_process_alive,
    run_with_cancellation, terminate_process,
};
