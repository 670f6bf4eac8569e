//! Queue processor: the single worker loop that drains the operation queue.
//!
//! Each tick reaps finished workers, propagates cancellations made by other
//! processes, fails `processing` rows that no live worker or subprocess owns,
//! then claims pending rows while the resource monitor and the concurrency
//! limit allow. Every claimed row runs on its own thread and
//! always ends in a terminal status; handler errors and panics are written
//! into the row's `result` and never leave the loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parvault_core::tracing_config::span_names;
use parvault_core::{OperationStatus, VaultError, VaultResult, unix_timestamp_ms};
use parvault_durability::{CancellationToken, is_process_alive};
use parvault_storage::{Operation, OperationQueue, Transition};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionEnv, ActionOutcome, error_result};
use crate::election::LeaderElection;
use crate::resource_monitor::ResourceMonitor;
use crate::shutdown::{ShutdownCoordinator, ShutdownReason};

const DRAIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorOptions {
    /// Keep running on an empty queue.
    pub foreground: bool,
    pub poll_interval: Duration,
    pub idle_exit: Duration,
    pub retention: Duration,
    pub max_concurrent: usize,
    pub adaptive_limits: bool,
    pub adaptive_interval: u32,
}

impl ProcessorOptions {
    #[must_use]
    pub fn from_config(config: &crate::config::VaultConfig, foreground: bool) -> Self {
        Self {
            foreground,
            poll_interval: config.processor.poll_interval(),
            idle_exit: config.processor.idle_exit(),
            retention: config.processor.retention(),
            max_concurrent: config.processor.max_concurrent_operations,
            adaptive_limits: config.resources.adaptive_limits,
            adaptive_interval: config.resources.adaptive_interval.max(1),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub claimed: usize,
    pub reaped: usize,
    pub cancelled: usize,
    /// Orphaned rows failed this tick.
    pub reconciled: usize,
    pub running: usize,
    /// Admission was refused by the resource monitor.
    pub throttled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorSummary {
    pub reconciled: usize,
    pub purged: usize,
    pub claimed: u64,
    pub stop_reason: Option<String>,
}

#[derive(Debug)]
struct Worker {
    operation_id: i64,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct QueueProcessor {
    env: ActionEnv,
    queue: OperationQueue,
    monitor: ResourceMonitor,
    election: Box<dyn LeaderElection>,
    shutdown: Arc<ShutdownCoordinator>,
    options: ProcessorOptions,
    workers: Vec<Worker>,
    claims_since_adapt: u32,
    summary: ProcessorSummary,
}

impl std::fmt::Debug for QueueProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueProcessor")
            .field("options", &self.options)
            .field("running", &self.workers.len())
            .field("summary", &self.summary)
            .finish_non_exhaustive()
    }
}

impl QueueProcessor {
    #[must_use]
    pub fn new(
        env: ActionEnv,
        monitor: ResourceMonitor,
        election: Box<dyn LeaderElection>,
        shutdown: Arc<ShutdownCoordinator>,
        options: ProcessorOptions,
    ) -> Self {
        Self {
            queue: env.queue.clone(),
            env,
            monitor,
            election,
            shutdown,
            options,
            workers: Vec::new(),
            claims_since_adapt: 0,
            summary: ProcessorSummary::default(),
        }
    }

    /// Win the election, recover from a previous crash, then drain the queue
    /// until shutdown (or idle exit outside foreground mode).
    pub fn run(mut self) -> VaultResult<ProcessorSummary> {
        self.election.try_acquire()?;
        let result = self.run_elected();
        self.election.release();
        result
    }

    fn run_elected(&mut self) -> VaultResult<ProcessorSummary> {
        self.startup()?;
        info!(
            target: "parvault.processor",
            op = "processor.start",
            pid = std::process::id(),
            foreground = self.options.foreground,
            max_concurrent = self.options.max_concurrent,
            "queue processor started"
        );

        let mut idle_since: Option<Instant> = None;
        loop {
            let report = self.tick();
            if self.shutdown.is_shutting_down() {
                if self.workers.is_empty() {
                    break;
                }
                thread::sleep(DRAIN_POLL.min(self.options.poll_interval));
                continue;
            }

            if report.running == 0 && self.pending_is_empty() {
                let since = *idle_since.get_or_insert_with(Instant::now);
                if !self.options.foreground && since.elapsed() >= self.options.idle_exit {
                    self.shutdown.request_shutdown(ShutdownReason::IdleExit);
                    break;
                }
            } else {
                idle_since = None;
            }
            self.shutdown.wait_timeout(self.options.poll_interval);
        }

        self.drain();
        self.summary.stop_reason = self.shutdown.current_reason().map(|reason| match reason {
            ShutdownReason::Signal(signal) => format!("signal {signal}"),
            ShutdownReason::IdleExit => "idle".to_owned(),
            ShutdownReason::UserRequest => "requested".to_owned(),
            ShutdownReason::Error(message) => format!("error: {message}"),
        });
        info!(
            target: "parvault.processor",
            op = "processor.stop",
            claimed = self.summary.claimed,
            reason = ?self.summary.stop_reason,
            "queue processor stopped"
        );
        Ok(self.summary.clone())
    }

    /// Fail rows orphaned by a dead processor and purge expired history.
    pub fn startup(&mut self) -> VaultResult<()> {
        self.summary.reconciled = self.reconcile_orphans()?;

        let retention_ms = i64::try_from(self.options.retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_timestamp_ms()?.saturating_sub(retention_ms);
        self.summary.purged = self.queue.purge_terminal_before(cutoff)?;
        Ok(())
    }

    /// One scheduling pass. Storage errors are logged and retried next tick.
    pub fn tick(&mut self) -> TickReport {
        let span = tracing::debug_span!(target: "parvault.processor", span_names::PROCESSOR_TICK);
        let _entered = span.enter();

        let mut report = TickReport {
            reaped: self.reap(),
            cancelled: self.propagate_cancellations(),
            ..TickReport::default()
        };
        // A crashed processor can leave a par2 child running past startup;
        // its row is failed once that child exits.
        match self.reconcile_orphans() {
            Ok(reconciled) => {
                report.reconciled = reconciled;
                self.summary.reconciled += reconciled;
            }
            Err(error) => warn!(
                target: "parvault.processor",
                error = %error,
                "orphan reconciliation failed"
            ),
        }

        if self.shutdown.is_force_exit_requested() {
            for worker in &self.workers {
                worker.token.cancel();
            }
        }
        if !self.shutdown.is_shutting_down() {
            let (claimed, throttled) = self.claim_available();
            report.claimed = claimed;
            report.throttled = throttled;
        }
        report.running = self.workers.len();
        report
    }

    /// Block until every running worker has finished.
    pub fn drain(&mut self) {
        for worker in self.workers.drain(..) {
            if worker.handle.join().is_err() {
                error!(
                    target: "parvault.processor",
                    operation_id = worker.operation_id,
                    "worker thread panicked"
                );
            }
        }
    }

    #[must_use]
    pub fn running(&self) -> usize {
        self.workers.len()
    }

    #[must_use]
    pub const fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    /// A `processing` row is owned while one of our workers runs it or its
    /// recorded pid is another live process.
    fn reconcile_orphans(&self) -> VaultResult<usize> {
        let own_pid = std::process::id();
        let running: Vec<i64> = self.workers.iter().map(|worker| worker.operation_id).collect();
        self.queue.reconcile_orphans(|id, pid| {
            running.contains(&id) || pid.is_some_and(|pid| pid != own_pid && is_process_alive(pid))
        })
    }

    fn reap(&mut self) -> usize {
        let (finished, running): (Vec<Worker>, Vec<Worker>) = self
            .workers
            .drain(..)
            .partition(|worker| worker.handle.is_finished());
        self.workers = running;
        let reaped = finished.len();
        for worker in finished {
            if worker.handle.join().is_err() {
                error!(
                    target: "parvault.processor",
                    operation_id = worker.operation_id,
                    "worker thread panicked"
                );
            }
        }
        reaped
    }

    /// Cancel local subprocesses whose rows were cancelled elsewhere.
    fn propagate_cancellations(&self) -> usize {
        let mut cancelled = 0;
        for worker in &self.workers {
            if worker.token.is_cancelled() {
                continue;
            }
            match self.queue.status(worker.operation_id) {
                Ok(Some(OperationStatus::Processing)) => {}
                Ok(status) => {
                    debug!(
                        target: "parvault.processor",
                        operation_id = worker.operation_id,
                        status = ?status,
                        "row left processing; cancelling worker"
                    );
                    worker.token.cancel();
                    cancelled += 1;
                }
                Err(error) => warn!(
                    target: "parvault.processor",
                    operation_id = worker.operation_id,
                    error = %error,
                    "could not re-check operation status"
                ),
            }
        }
        cancelled
    }

    fn claim_available(&mut self) -> (usize, bool) {
        let mut claimed = 0;
        while self.workers.len() < self.options.max_concurrent {
            if !self.pending_exists() {
                break;
            }
            let availability = self.monitor.check_availability();
            if !availability.available {
                debug!(
                    target: "parvault.processor",
                    reasons = ?availability.reasons,
                    "admission deferred"
                );
                return (claimed, true);
            }
            match self
                .queue
                .claim_next(std::process::id(), self.options.max_concurrent)
            {
                Ok(Some(operation)) => {
                    self.spawn_worker(operation);
                    claimed += 1;
                    self.after_claim();
                }
                Ok(None) => break,
                Err(error) => {
                    warn!(target: "parvault.processor", error = %error, "claim failed");
                    break;
                }
            }
        }
        (claimed, false)
    }

    fn after_claim(&mut self) {
        self.summary.claimed += 1;
        if !self.options.adaptive_limits {
            return;
        }
        self.claims_since_adapt += 1;
        if self.claims_since_adapt >= self.options.adaptive_interval {
            self.claims_since_adapt = 0;
            self.monitor.calculate_adaptive_limits();
        }
    }

    fn spawn_worker(&mut self, operation: Operation) {
        let token = CancellationToken::new();
        let env = self.env.clone();
        let worker_token = token.clone();
        let operation_id = operation.id;
        let spawned = thread::Builder::new()
            .name(format!("parvault-op-{operation_id}"))
            .spawn(move || run_operation(&env, &operation, &worker_token));
        match spawned {
            Ok(handle) => self.workers.push(Worker {
                operation_id,
                token,
                handle,
            }),
            Err(spawn_error) => {
                let error = VaultError::from(spawn_error);
                error!(target: "parvault.processor", operation_id, error = %error, "worker spawn failed");
                if let Err(error) = self.queue.fail(operation_id, &error_result(&error)) {
                    error!(target: "parvault.processor", operation_id, error = %error, "could not fail operation");
                }
            }
        }
    }

    fn pending_exists(&self) -> bool {
        self.queue
            .queue_depth()
            .map_or(true, |depth| depth.pending > 0)
    }

    fn pending_is_empty(&self) -> bool {
        self.queue
            .queue_depth()
            .is_ok_and(|depth| depth.active() == 0)
    }
}

/// Execute one claimed row and store its terminal status.
pub fn run_operation(env: &ActionEnv, operation: &Operation, token: &CancellationToken) {
    let span = tracing::info_span!(
        target: "parvault.processor",
        span_names::OPERATION,
        operation_id = operation.id,
        operation_type = operation.operation_type.as_str()
    );
    let _entered = span.enter();
    let started = Instant::now();

    let outcome = catch_unwind(AssertUnwindSafe(|| actions::execute(env, operation, token)))
        .unwrap_or_else(|_| {
            Err(VaultError::SubsystemError {
                subsystem: "processor",
                source: "operation handler panicked".into(),
            })
        });

    let queue = &env.queue;
    let (status, stored) = match &outcome {
        Ok(ActionOutcome::Completed(result)) => ("completed", queue.complete(operation.id, result)),
        Ok(ActionOutcome::Skipped(result)) => ("skipped", queue.skip(operation.id, result)),
        Ok(ActionOutcome::Failed(result)) => ("failed", queue.fail(operation.id, result)),
        Err(VaultError::Cancelled { .. }) => (
            "cancelled",
            queue.fail(operation.id, &json!({ "error": "cancelled", "code": "cancelled" })),
        ),
        Err(error) => {
            warn!(
                target: "parvault.processor",
                operation_id = operation.id,
                code = error.code(),
                error = %error,
                "operation failed"
            );
            ("failed", queue.fail(operation.id, &error_result(error)))
        }
    };

    let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match stored {
        Ok(Transition::Applied) => info!(
            target: "parvault.processor",
            operation_id = operation.id,
            status,
            duration_ms,
            "operation finished"
        ),
        Ok(Transition::Superseded { current }) => info!(
            target: "parvault.processor",
            operation_id = operation.id,
            current = current.as_str(),
            duration_ms,
            "operation result discarded; row already terminal"
        ),
        Err(error) => error!(
            target: "parvault.processor",
            operation_id = operation.id,
            error = %error,
            "could not store operation result"
        ),
    }
}
