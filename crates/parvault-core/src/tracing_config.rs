//! Tracing conventions shared by every parvault crate.
//!
//! Consumers filter parvault logs with the common target prefix:
//! ```text
//! RUST_LOG=parvault=debug
//! ```

use tracing::Level;

/// Target prefix used by all parvault tracing events.
pub const TARGET_PREFIX: &str = "parvault";

/// Environment variable holding a bare default level.
pub const LEVEL_ENV: &str = "PARVAULT_LOG_LEVEL";

/// Standard span names.
pub mod span_names {
    /// One claimed queue entry, from claim to terminal status.
    pub const OPERATION: &str = "parvault::operation";
    /// A single par2 subprocess run.
    pub const PAR2_RUN: &str = "parvault::par2_run";
    /// One processor poll tick.
    pub const PROCESSOR_TICK: &str = "parvault::processor_tick";
    /// Metadata capture/verify/restore pass.
    pub const METADATA_PASS: &str = "parvault::metadata_pass";
}

/// Standard structured field names.
pub mod field_names {
    pub const OPERATION_ID: &str = "operation_id";
    pub const OPERATION_TYPE: &str = "operation_type";
    pub const ITEM_ID: &str = "item_id";
    pub const PATH: &str = "path";
    pub const STATUS: &str = "status";
    pub const EXIT_STATUS: &str = "exit_status";
    pub const DURATION_MS: &str = "duration_ms";
    pub const PID: &str = "pid";
}

/// Parse a log level string (case-insensitive).
#[must_use]
pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        _ => None,
    }
}

/// `PARVAULT_LOG_LEVEL` if set and valid, otherwise `default`.
#[must_use]
pub fn level_from_env(default: Level) -> Level {
    std::env::var(LEVEL_ENV)
        .ok()
        .and_then(|s| parse_level(&s))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_names_start_with_target_prefix() {
        for span in [
            span_names::OPERATION,
            span_names::PAR2_RUN,
            span_names::PROCESSOR_TICK,
            span_names::METADATA_PASS,
        ] {
            assert!(
                span.starts_with(&format!("{TARGET_PREFIX}::")),
                "span {span:?} must start with \"{TARGET_PREFIX}::\"",
            );
        }
    }

    #[test]
    fn parse_level_is_case_insensitive() {
        assert_eq!(parse_level("Debug"), Some(Level::DEBUG));
        assert_eq!(parse_level("ERROR"), Some(Level::ERROR));
        assert_eq!(parse_level("verbose"), None);
        assert_eq!(parse_level(" info"), None);
    }
}
