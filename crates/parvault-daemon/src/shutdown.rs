use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use parvault_core::{VaultError, VaultResult};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::iterator::Handle as SignalHandle;
use tracing::{debug, info, warn};

/// A second `SIGINT` inside this window stops in-flight work too.
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(3);
const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    /// Stop claiming; let running operations finish.
    Draining,
    /// Cancel running operations as well.
    ForceExit,
}

impl ShutdownState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Draining => 1,
            Self::ForceExit => 2,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Draining,
            2 => Self::ForceExit,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    IdleExit,
    UserRequest,
    Error(String),
}

/// Shutdown intent shared between the signal listener and the processor loop.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: AtomicU8,
    reason: Mutex<Option<ShutdownReason>>,
    first_sigint_at: Mutex<Option<Instant>>,
    signals_registered: AtomicBool,
    signal_handle: Mutex<Option<SignalHandle>>,
    listener: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running.as_u8()),
            reason: Mutex::new(None),
            first_sigint_at: Mutex::new(None),
            signals_registered: AtomicBool::new(false),
            signal_handle: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Start the SIGINT/SIGTERM listener thread. Idempotent.
    pub fn register_signals(self: &Arc<Self>) -> VaultResult<()> {
        if self
            .signals_registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM])
            .map_err(|error| self.registration_failed("failed to register signal listeners", &error))?;
        let handle = signals.handle();

        let coordinator = Arc::clone(self);
        let listener = thread::Builder::new()
            .name("parvault-signals".to_owned())
            .spawn(move || {
                for signal in signals.forever() {
                    coordinator.handle_signal(signal);
                }
            })
            .map_err(|error| self.registration_failed("failed to start signal listener", &error))?;

        *lock_or_recover(&self.signal_handle) = Some(handle);
        *lock_or_recover(&self.listener) = Some(listener);
        Ok(())
    }

    fn registration_failed(&self, what: &str, error: &io::Error) -> VaultError {
        self.signals_registered.store(false, Ordering::Release);
        VaultError::SubsystemError {
            subsystem: "signals",
            source: Box::new(io::Error::other(format!("{what}: {error}"))),
        }
    }

    pub fn stop_signal_listener(&self) {
        if let Some(handle) = lock_or_recover(&self.signal_handle).take() {
            handle.close();
        }
        let listener = lock_or_recover(&self.listener).take();
        if let Some(listener) = listener
            && listener.join().is_err()
        {
            warn!(target: "parvault.processor", "signal listener thread panicked");
        }
        self.signals_registered.store(false, Ordering::Release);
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running.as_u8(),
                ShutdownState::Draining.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(target: "parvault.processor", reason = ?reason, "shutdown requested");
            *lock_or_recover(&self.reason) = Some(reason);
        }
    }

    #[must_use]
    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    #[must_use]
    pub fn is_force_exit_requested(&self) -> bool {
        self.state() == ShutdownState::ForceExit
    }

    #[must_use]
    pub fn current_reason(&self) -> Option<ShutdownReason> {
        lock_or_recover(&self.reason).clone()
    }

    /// Sleep up to `timeout`, returning early (with `true`) once shutdown
    /// has been requested.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_shutting_down() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            thread::sleep(WAIT_SLICE.min(deadline - now));
        }
    }

    fn handle_signal(&self, signal: i32) {
        match signal {
            SIGINT => self.handle_sigint(),
            SIGTERM => self.request_shutdown(ShutdownReason::Signal(SIGTERM)),
            _ => debug!(target: "parvault.processor", signal, "ignoring unexpected signal"),
        }
    }

    fn handle_sigint(&self) {
        let now = Instant::now();
        match self.state() {
            ShutdownState::Running => {
                *lock_or_recover(&self.first_sigint_at) = Some(now);
                self.request_shutdown(ShutdownReason::Signal(SIGINT));
            }
            ShutdownState::Draining => {
                let first = *lock_or_recover(&self.first_sigint_at);
                if first.is_some_and(|first| now.saturating_duration_since(first) <= FORCE_EXIT_WINDOW)
                {
                    self.state
                        .store(ShutdownState::ForceExit.as_u8(), Ordering::Release);
                    warn!(
                        target: "parvault.processor",
                        "second SIGINT within window, cancelling running operations"
                    );
                    return;
                }
                *lock_or_recover(&self.first_sigint_at) = Some(now);
            }
            ShutdownState::ForceExit => {}
        }
    }

    #[cfg(test)]
    pub(crate) fn process_signal_for_test(&self, signal: i32) {
        self.handle_signal(signal);
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
