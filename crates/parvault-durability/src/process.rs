//! Subprocess execution with concurrent pipe draining, cancellation and a
//! wall-clock budget.

use std::io::Read;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parvault_core::tracing_config::span_names;
use parvault_core::{VaultError, VaultResult};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::Par2Command;
use crate::config::ParityConfig;

const READ_CHUNK: usize = 8 * 1024;

/// Shared flag flipped by whoever wants a running subprocess stopped.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Wall-clock budget; `None` waits forever.
    pub timeout: Option<Duration>,
    /// SIGTERM to SIGKILL delay.
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            grace: Duration::from_secs(5),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl RunOptions {
    #[must_use]
    pub fn from_config(config: &ParityConfig) -> Self {
        Self {
            timeout: config.max_runtime(),
            grace: config.terminate_grace(),
            ..Self::default()
        }
    }
}

/// Why the run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEnd {
    Exited,
    Cancelled,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub success: bool,
    /// `None` when the child was terminated by a signal.
    pub exit_status: Option<i32>,
    /// Interleaved stdout and stderr.
    pub combined_output: String,
    pub pid: u32,
    pub elapsed: Duration,
    pub end: RunEnd,
}

/// Spawn `command` and wait for it while draining both pipes.
///
/// `on_spawn` receives the child pid before any output is read. When `token`
/// is cancelled or the budget in `options` runs out, the child gets SIGTERM
/// and, after `options.grace`, SIGKILL.
pub fn run_with_cancellation(
    command: &Par2Command,
    options: &RunOptions,
    token: &CancellationToken,
    on_spawn: impl FnOnce(u32),
) -> VaultResult<ProcessOutcome> {
    let mut child = command
        .to_command()
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| VaultError::ToolSpawn {
            binary: command.program.clone(),
            source,
        })?;
    let pid = child.id();
    let started = Instant::now();
    on_spawn(pid);
    debug!(
        target: "parvault.runner",
        pid,
        subcommand = command.subcommand.name(),
        "par2 spawned"
    );

    let (sender, receiver) = mpsc::channel::<Vec<u8>>();
    let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, sender.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, sender.clone()));
    }
    drop(sender);

    let mut output = Vec::new();
    let (status, end) = loop {
        drain(&receiver, &mut output);
        if let Some(status) = child.try_wait()? {
            break (status, RunEnd::Exited);
        }
        if token.is_cancelled() {
            break (terminate_child(&mut child, options)?, RunEnd::Cancelled);
        }
        if options.timeout.is_some_and(|budget| started.elapsed() >= budget) {
            break (terminate_child(&mut child, options)?, RunEnd::TimedOut);
        }
        thread::sleep(options.poll_interval);
    };

    for reader in readers {
        if reader.join().is_err() {
            warn!(target: "parvault.runner", pid, "output reader panicked");
        }
    }
    drain(&receiver, &mut output);

    Ok(ProcessOutcome {
        success: end == RunEnd::Exited && status.success(),
        exit_status: status.code(),
        combined_output: String::from_utf8_lossy(&output).into_owned(),
        pid,
        elapsed: started.elapsed(),
        end,
    })
}

fn spawn_reader<R: Read + Send + 'static>(
    mut pipe: R,
    sender: mpsc::Sender<Vec<u8>>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut buffer = [0_u8; READ_CHUNK];
        loop {
            match pipe.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(read) => {
                    if sender.send(buffer[..read].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

fn drain(receiver: &Receiver<Vec<u8>>, output: &mut Vec<u8>) {
    for chunk in receiver.try_iter() {
        output.extend_from_slice(&chunk);
    }
}

fn terminate_child(child: &mut Child, options: &RunOptions) -> VaultResult<ExitStatus> {
    let pid = child.id();
    send_signal(pid, libc::SIGTERM);
    let deadline = Instant::now() + options.grace;
    while Instant::now() < deadline {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        thread::sleep(options.poll_interval);
    }
    warn!(target: "parvault.runner", pid, "par2 ignored SIGTERM; killing");
    // Already-exited children make kill() fail; wait() still reaps them.
    let _ = child.kill();
    Ok(child.wait()?)
}

/// Whether a process with `pid` exists. EPERM counts as alive.
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    #[allow(unsafe_code)]
    // SAFETY: kill with signal 0 performs only the existence and permission
    // check; no signal is delivered.
    let result = unsafe { libc::kill(raw, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// SIGTERM a process that is not our child, then SIGKILL after `grace`.
///
/// Returns `false` when the process was already gone.
pub fn terminate_process(pid: u32, grace: Duration) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    send_signal(pid, libc::SIGTERM);
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    if is_process_alive(pid) {
        warn!(target: "parvault.runner", pid, "process ignored SIGTERM; sending SIGKILL");
        send_signal(pid, libc::SIGKILL);
    }
    true
}

fn send_signal(pid: u32, signal: libc::c_int) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    #[allow(unsafe_code)]
    // SAFETY: raw is a positive pid, so kill targets exactly one process.
    let result = unsafe { libc::kill(raw, signal) };
    if result != 0 {
        debug!(
            target: "parvault.runner",
            pid,
            signal,
            error = %std::io::Error::last_os_error(),
            "signal not delivered"
        );
    }
}

/// Runs par2 commands for one queue entry and maps abnormal endings to errors.
#[derive(Debug, Clone)]
pub struct Par2Runner {
    options: RunOptions,
}

impl Par2Runner {
    #[must_use]
    pub const fn new(options: RunOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn from_config(config: &ParityConfig) -> Self {
        Self::new(RunOptions::from_config(config))
    }

    #[must_use]
    pub const fn options(&self) -> &RunOptions {
        &self.options
    }

    /// Run to completion. Cancellation and budget overruns become
    /// [`VaultError::Cancelled`] and [`VaultError::ToolTimeout`]; a nonzero
    /// exit is returned as an outcome for the classifier to judge.
    pub fn run(
        &self,
        command: &Par2Command,
        operation_id: i64,
        token: &CancellationToken,
        on_spawn: impl FnOnce(u32),
    ) -> VaultResult<ProcessOutcome> {
        let span = tracing::info_span!(
            target: "parvault.runner",
            span_names::PAR2_RUN,
            operation_id,
            subcommand = command.subcommand.name()
        );
        let _entered = span.enter();

        let outcome = run_with_cancellation(command, &self.options, token, on_spawn)?;
        let elapsed_ms = u64::try_from(outcome.elapsed.as_millis()).unwrap_or(u64::MAX);
        match outcome.end {
            RunEnd::Exited => {
                info!(
                    target: "parvault.runner",
                    operation_id,
                    pid = outcome.pid,
                    exit_status = ?outcome.exit_status,
                    duration_ms = elapsed_ms,
                    "par2 finished"
                );
                Ok(outcome)
            }
            RunEnd::Cancelled => {
                info!(target: "parvault.runner", operation_id, pid = outcome.pid, "par2 cancelled");
                Err(VaultError::Cancelled { operation_id })
            }
            RunEnd::TimedOut => {
                let budget_ms = self
                    .options
                    .timeout
                    .map_or(0, |budget| u64::try_from(budget.as_millis()).unwrap_or(u64::MAX));
                warn!(
                    target: "parvault.runner",
                    operation_id,
                    pid = outcome.pid,
                    elapsed_ms,
                    budget_ms,
                    "par2 exceeded its runtime budget"
                );
                Err(VaultError::ToolTimeout {
                    elapsed_ms,
                    budget_ms,
                })
            }
        }
    }
}
