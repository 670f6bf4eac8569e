//! Wires a loaded configuration to storage, the queue service and the
//! processor, and executes parsed CLI commands against them.

use std::path::PathBuf;
use std::sync::Arc;

use parvault_core::VaultResult;
use parvault_storage::Storage;
use serde_json::{Value, json};

use crate::actions::ActionEnv;
use crate::adapters::cli::CliCommand;
use crate::config::VaultConfig;
use crate::election::PidFileElection;
use crate::processor::{ProcessorOptions, ProcessorSummary, QueueProcessor};
use crate::resource_monitor::ResourceMonitor;
use crate::service::{ProcessorLauncher, QueueService};
use crate::shutdown::ShutdownCoordinator;

#[derive(Debug, Clone)]
pub struct VaultRuntime {
    config: Arc<VaultConfig>,
    storage: Arc<Storage>,
    service: QueueService,
}

impl VaultRuntime {
    /// Open the configured database. `launcher` decides how enqueues start
    /// a processor.
    pub fn open(config: VaultConfig, launcher: ProcessorLauncher) -> VaultResult<Self> {
        let storage = Arc::new(Storage::open(config.storage.to_storage_config())?);
        let service = QueueService::new(
            Arc::clone(&storage),
            launcher,
            config.parity.terminate_grace(),
        );
        Ok(Self {
            config: Arc::new(config),
            storage,
            service,
        })
    }

    #[must_use]
    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    #[must_use]
    pub const fn service(&self) -> &QueueService {
        &self.service
    }

    #[must_use]
    pub fn pid_file(&self) -> PathBuf {
        PathBuf::from(&self.config.processor.pid_file)
    }

    /// Execute a parsed command, returning its JSON payload. `run` blocks
    /// until the processor stops.
    pub fn execute(&self, command: &CliCommand) -> VaultResult<Value> {
        let service = &self.service;
        let payload = match command {
            CliCommand::Run { foreground } => {
                let shutdown = Arc::new(ShutdownCoordinator::new());
                shutdown.register_signals()?;
                let summary = self.run_processor(*foreground, &shutdown);
                shutdown.stop_signal_listener();
                json!(summary?)
            }
            CliCommand::Enqueue { kind, params } => json!(service.add_operation(*kind, params)?),
            CliCommand::Status { operation_id } => json!(service.operation(*operation_id)?),
            CliCommand::Cancel { operation_id } => json!(service.cancel(*operation_id)?),
            CliCommand::List { active, limit } => {
                let operations = if *active {
                    service.active_operations()?
                } else {
                    service.recent_operations(*limit)?
                };
                json!({
                    "depth": service.queue_depth()?,
                    "operations": operations,
                })
            }
            CliCommand::Items { path: Some(path) } => json!({
                "items": service.items_by_path(path)?,
                "redundancy": service.redundancy_by_path(path)?,
                "operations": service.operations_for_path(path)?,
            }),
            CliCommand::Items { path: None } => json!({ "items": service.items()? }),
            CliCommand::History { item_id, limit } => json!({
                "item": service.item(*item_id)?,
                "history": service.history(*item_id, *limit)?,
            }),
        };
        Ok(payload)
    }

    /// Elect this process as the queue processor and drain the queue.
    pub fn run_processor(
        &self,
        foreground: bool,
        shutdown: &Arc<ShutdownCoordinator>,
    ) -> VaultResult<ProcessorSummary> {
        let monitor = ResourceMonitor::with_host_sampler(&self.config.resources);
        let env = ActionEnv::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.config),
            monitor.core_count(),
        );
        let processor = QueueProcessor::new(
            env,
            monitor,
            Box::new(PidFileElection::new(self.pid_file())),
            Arc::clone(shutdown),
            ProcessorOptions::from_config(&self.config, foreground),
        );
        processor.run()
    }
}
