//! Subscriber setup for the `parvault` binary.
//!
//! Filter priority, highest first:
//!
//! 1. `PARVAULT_LOG` (full directives, e.g. `parvault.runner=debug,warn`)
//! 2. `RUST_LOG`
//! 3. `-v` / `-q` flags, or `PARVAULT_LOG_LEVEL` when neither flag is given
//! 4. `warn`
//!
//! Logs go to stderr; stdout carries the JSON command output.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use parvault_core::tracing_config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    /// Verbose wins when both flags are set.
    #[must_use]
    pub const fn from_flags(verbose: bool, quiet: bool) -> Self {
        if verbose {
            Self::Verbose
        } else if quiet {
            Self::Quiet
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub const fn default_level(self) -> Level {
        match self {
            Self::Quiet => Level::ERROR,
            Self::Normal => Level::WARN,
            Self::Verbose => Level::DEBUG,
        }
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_subscriber(verbosity: Verbosity, no_color: bool) {
    let filter = build_env_filter(verbosity, |key| std::env::var(key).ok());

    let stderr_is_tty = std::io::IsTerminal::is_terminal(&std::io::stderr());
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color && stderr_is_tty)
        .with_target(true)
        .with_level(true);

    let result = if verbosity == Verbosity::Verbose {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.with_timer(fmt::time::uptime()))
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer.without_time().compact())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!(target: "parvault.config", "tracing subscriber already installed");
    }
}

fn build_env_filter(verbosity: Verbosity, env: impl Fn(&str) -> Option<String>) -> EnvFilter {
    if let Some(directives) = env("PARVAULT_LOG")
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }
    if let Some(directives) = env("RUST_LOG")
        && let Ok(filter) = EnvFilter::try_new(&directives)
    {
        return filter;
    }

    let directive = filter_directive(verbosity, env(tracing_config::LEVEL_ENV).as_deref());
    EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"))
}

fn filter_directive(verbosity: Verbosity, level_env: Option<&str>) -> String {
    match verbosity {
        Verbosity::Verbose => format!(
            "{level},{prefix}=debug",
            level = verbosity.default_level(),
            prefix = tracing_config::TARGET_PREFIX,
        ),
        Verbosity::Quiet => verbosity.default_level().to_string(),
        Verbosity::Normal => level_env
            .and_then(tracing_config::parse_level)
            .unwrap_or_else(|| verbosity.default_level())
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_wins_over_quiet() {
        assert_eq!(Verbosity::from_flags(true, true), Verbosity::Verbose);
        assert_eq!(Verbosity::from_flags(false, true), Verbosity::Quiet);
        assert_eq!(Verbosity::from_flags(false, false), Verbosity::Normal);
    }

    #[test]
    fn verbose_raises_project_targets() {
        assert_eq!(
            filter_directive(Verbosity::Verbose, None),
            "DEBUG,parvault=debug"
        );
    }

    #[test]
    fn level_env_only_applies_without_flags() {
        assert_eq!(filter_directive(Verbosity::Normal, Some("info")), "INFO");
        assert_eq!(filter_directive(Verbosity::Normal, Some("nonsense")), "WARN");
        assert_eq!(filter_directive(Verbosity::Quiet, Some("trace")), "ERROR");
    }

    #[test]
    fn project_env_outranks_rust_log() {
        let filter = build_env_filter(Verbosity::Normal, |key| match key {
            "PARVAULT_LOG" => Some("parvault=trace".to_owned()),
            "RUST_LOG" => Some("error".to_owned()),
            _ => None,
        });
        assert!(filter.to_string().contains("parvault=trace"));
    }
}
