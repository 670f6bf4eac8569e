//! Queue processor, resource monitor and operator CLI for parvault.
//!
//! Runtime logic (processor, actions, election, monitoring) lives in plain
//! modules; `adapters` holds the CLI surface that maps arguments and results
//! to and from it.
#![allow(
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions
)]

pub mod actions;
pub mod adapters;
pub mod config;
pub mod election;
pub mod processor;
pub mod resource_monitor;
pub mod runtime;
pub mod service;
pub mod shutdown;
pub mod tracing_setup;

pub use actions::{ActionEnv, ActionOutcome, error_result};
pub use adapters::cli::{CliCommand, CliInput, forwarded_args, parse_cli_args};
pub use adapters::output::{
    OutputEnvelope, OutputError, OutputMeta, emit_json, exit_code, exit_code_for,
};
pub use config::{
    CliOverrides, ConfigLoadResult, ConfigSource, ConfigWarning, MetadataConfig, ProcessorConfig,
    ResourceConfig, StorageSection, VaultConfig, default_config_file_path, default_db_path,
    default_pid_file, emit_config_loaded, load_from_sources, load_from_str,
};
pub use election::{LeaderElection, PidFileContents, PidFileElection, live_leader};
pub use processor::{ProcessorOptions, ProcessorSummary, QueueProcessor, TickReport, run_operation};
pub use resource_monitor::{
    Availability, HostSampler, ResourceHistory, ResourceLimits, ResourceMetrics, ResourceMonitor,
    ResourceSampler,
};
pub use runtime::VaultRuntime;
pub use service::{CancelReceipt, EnqueueReceipt, LaunchOutcome, ProcessorLauncher, QueueService};
pub use shutdown::{ShutdownCoordinator, ShutdownReason, ShutdownState};
pub use tracing_setup::{Verbosity, init_subscriber};
