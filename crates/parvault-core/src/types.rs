//! Domain types shared by the store, the runner and the processor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

const INDIVIDUAL_PREFIX: &str = "individual:";

// ─── Protection mode ────────────────────────────────────────────────────────

/// How a protected path is covered by parity data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ProtectionMode {
    /// A single file with one parity set.
    File,
    /// A directory tree with one (or batched) parity set(s).
    Directory,
    /// Every matching file in a directory gets its own parity set.
    IndividualFiles { category: String },
}

impl ProtectionMode {
    /// Storage form: `file`, `directory` or `individual:<category>`.
    #[must_use]
    pub fn to_db_string(&self) -> String {
        match self {
            Self::File => "file".to_owned(),
            Self::Directory => "directory".to_owned(),
            Self::IndividualFiles { category } => format!("{INDIVIDUAL_PREFIX}{category}"),
        }
    }

    #[must_use]
    pub const fn is_individual(&self) -> bool {
        matches!(self, Self::IndividualFiles { .. })
    }
}

impl FromStr for ProtectionMode {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "file" => Ok(Self::File),
            "directory" => Ok(Self::Directory),
            other => match other.strip_prefix(INDIVIDUAL_PREFIX) {
                Some(category) if !category.trim().is_empty() => Ok(Self::IndividualFiles {
                    category: category.to_owned(),
                }),
                _ => Err(VaultError::invalid_parameter(
                    "mode",
                    value,
                    "expected file|directory|individual:<category>",
                )),
            },
        }
    }
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_db_string())
    }
}

// ─── Item status ────────────────────────────────────────────────────────────

/// Integrity status of a protected item, as derived from par2 output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemStatus {
    Protected,
    Damaged,
    Missing,
    Repaired,
    RepairFailed,
    Error,
    Unknown,
}

impl ItemStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protected => "PROTECTED",
            Self::Damaged => "DAMAGED",
            Self::Missing => "MISSING",
            Self::Repaired => "REPAIRED",
            Self::RepairFailed => "REPAIR_FAILED",
            Self::Error => "ERROR",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PROTECTED" => Some(Self::Protected),
            "DAMAGED" => Some(Self::Damaged),
            "MISSING" => Some(Self::Missing),
            "REPAIRED" => Some(Self::Repaired),
            "REPAIR_FAILED" => Some(Self::RepairFailed),
            "ERROR" => Some(Self::Error),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Whether the data is currently intact.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Protected | Self::Repaired)
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Metadata status ────────────────────────────────────────────────────────

/// Overall outcome of a metadata verification pass.
///
/// Ordered by precedence: `MissingFiles` outranks `MetadataIssues`, which
/// outranks `Verified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetadataStatus {
    Verified,
    MetadataIssues,
    MissingFiles,
}

impl MetadataStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verified => "VERIFIED",
            Self::MetadataIssues => "METADATA_ISSUES",
            Self::MissingFiles => "MISSING_FILES",
        }
    }
}

// ─── Operation kind / status ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Protect,
    Verify,
    Repair,
    Remove,
}

impl OperationKind {
    pub const ALL: [Self; 4] = [Self::Protect, Self::Verify, Self::Repair, Self::Remove];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Protect => "protect",
            Self::Verify => "verify",
            Self::Repair => "repair",
            Self::Remove => "remove",
        }
    }
}

impl FromStr for OperationKind {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == value)
            .ok_or_else(|| {
                VaultError::invalid_parameter(
                    "operation_type",
                    value,
                    "expected protect|verify|repair|remove",
                )
            })
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue entry state machine.
///
/// `Pending → Processing → {Completed, Failed, Cancelled, Skipped}`, plus the
/// direct `Pending → Cancelled` edge for entries cancelled before a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl OperationStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Processing,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::Skipped,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == value)
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
        )
    }

    /// Whether `self → next` is an edge of the state machine.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing | Self::Cancelled)
                | (
                    Self::Processing,
                    Self::Completed | Self::Failed | Self::Cancelled | Self::Skipped
                )
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Operation parameters ───────────────────────────────────────────────────

/// Typed view of the `parameters` column of a queue entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redundancy: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_types: Option<Vec<String>>,
    /// Selects individual-files mode under this category name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub capture_metadata: bool,
    pub verify_metadata: bool,
    pub auto_restore_metadata: bool,
    /// Re-protect even when parity already exists.
    pub force: bool,
    /// Remove only: delete parity files from disk (default true).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_parity: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl OperationParams {
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn for_id(id: i64) -> Self {
        Self {
            id: Some(id),
            ..Self::default()
        }
    }

    /// Enqueue-time validation: at least one of `path` or `id` is required.
    pub fn validate(&self, kind: OperationKind) -> VaultResult<()> {
        let has_path = self
            .path
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        if !has_path && self.id.is_none() {
            return Err(VaultError::invalid_parameter(
                "parameters",
                kind.as_str(),
                "at least one of path or id is required",
            ));
        }
        if kind == OperationKind::Protect && !has_path {
            return Err(VaultError::invalid_parameter(
                "path",
                "",
                "protect requires a path",
            ));
        }
        if let Some(redundancy) = self.redundancy
            && !(1..=100).contains(&redundancy)
        {
            return Err(VaultError::invalid_parameter(
                "redundancy",
                redundancy.to_string(),
                "must be between 1 and 100 percent",
            ));
        }
        if let Some(id) = self.id
            && id <= 0
        {
            return Err(VaultError::invalid_parameter(
                "id",
                id.to_string(),
                "must be a positive row id",
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn delete_parity(&self) -> bool {
        self.delete_parity.unwrap_or(true)
    }

    pub fn to_json(&self) -> VaultResult<String> {
        serde_json::to_string(self).map_err(|error| VaultError::SubsystemError {
            subsystem: "serialization",
            source: Box::new(error),
        })
    }

    pub fn from_json(raw: &str) -> VaultResult<Self> {
        serde_json::from_str(raw).map_err(|error| VaultError::SubsystemError {
            subsystem: "serialization",
            source: Box::new(error),
        })
    }
}

/// Normalize an extension list: lowercase, no leading dot, sorted, unique.
///
/// Returns `None` for an empty result so "all files" has one representation.
#[must_use]
pub fn normalize_file_types<S: AsRef<str>>(types: &[S]) -> Option<Vec<String>> {
    let mut normalized: Vec<String> = types
        .iter()
        .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Milliseconds since the unix epoch.
pub fn unix_timestamp_ms() -> VaultResult<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| VaultError::SubsystemError {
            subsystem: "clock",
            source: Box::new(error),
        })?;
    i64::try_from(elapsed.as_millis()).map_err(|error| VaultError::SubsystemError {
        subsystem: "clock",
        source: Box::new(error),
    })
}
