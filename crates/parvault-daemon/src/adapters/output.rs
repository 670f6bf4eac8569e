//! JSON envelope written to stdout for every CLI command.
//!
//! `ok == true` carries `data`; `ok == false` carries `error`. Error codes
//! are [`VaultError::code`] values, so scripts can branch on them.

use std::io::{self, Write};

use parvault_core::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};

pub const OUTPUT_SCHEMA_VERSION: u32 = 1;

/// Process exit codes.
pub mod exit_code {
    pub const OK: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE_ERROR: i32 = 2;
    /// Another processor already holds the lock.
    pub const ALREADY_RUNNING: i32 = 3;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputError {
    pub code: String,
    pub message: String,
}

impl From<&VaultError> for OutputError {
    fn from(error: &VaultError) -> Self {
        Self {
            code: error.code().to_owned(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMeta {
    pub command: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputEnvelope<T> {
    pub v: u32,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OutputError>,
    pub meta: OutputMeta,
}

impl<T> OutputEnvelope<T> {
    #[must_use]
    pub const fn success(data: T, meta: OutputMeta) -> Self {
        Self {
            v: OUTPUT_SCHEMA_VERSION,
            ok: true,
            data: Some(data),
            error: None,
            meta,
        }
    }

    #[must_use]
    pub const fn error(error: OutputError, meta: OutputMeta) -> Self {
        Self {
            v: OUTPUT_SCHEMA_VERSION,
            ok: false,
            data: None,
            error: Some(error),
            meta,
        }
    }
}

/// Exit code for an error that ended a command.
#[must_use]
pub const fn exit_code_for(error: &VaultError) -> i32 {
    match error {
        VaultError::InvalidConfig { .. } => exit_code::USAGE_ERROR,
        VaultError::ProcessorAlreadyRunning { .. } => exit_code::ALREADY_RUNNING,
        _ => exit_code::FAILURE,
    }
}

/// Pretty JSON plus a trailing newline.
pub fn emit_json<T: Serialize, W: Write>(envelope: &OutputEnvelope<T>, writer: &mut W) -> VaultResult<()> {
    serde_json::to_writer_pretty(&mut *writer, envelope).map_err(|source| {
        VaultError::SubsystemError {
            subsystem: "output",
            source: Box::new(io::Error::other(format!(
                "failed to serialize envelope as JSON: {source}"
            ))),
        }
    })?;
    writer.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> OutputMeta {
        OutputMeta {
            command: "status".to_owned(),
            elapsed_ms: 3,
        }
    }

    #[test]
    fn success_envelope_has_data_and_no_error() {
        let mut out = Vec::new();
        emit_json(&OutputEnvelope::success(vec![1, 2], meta()), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"ok\": true"));
        assert!(!text.contains("\"error\""));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn error_envelope_uses_stable_codes() {
        let error = VaultError::NotFound {
            entity: "operation_queue",
            key: "9".to_owned(),
        };
        let envelope: OutputEnvelope<()> = OutputEnvelope::error((&error).into(), meta());
        let mut out = Vec::new();
        emit_json(&envelope, &mut out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed["ok"], false);
        assert_eq!(parsed["error"]["code"], "not_found");
        assert_eq!(exit_code_for(&error), exit_code::FAILURE);
        assert_eq!(
            exit_code_for(&VaultError::ProcessorAlreadyRunning { pid: 4 }),
            exit_code::ALREADY_RUNNING
        );
    }
}
