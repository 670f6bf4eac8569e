//! par2 output classification.
//!
//! Rules are ordered; the first match wins. Classification is a pure
//! function of the output text so results are reproducible from stored
//! output.

use std::fmt::Write as _;
use std::sync::OnceLock;

use parvault_core::{ItemStatus, VaultError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

const EXCERPT_CHARS: usize = 512;

/// Verify output meaning the data is intact.
const INTACT_PATTERNS: &[&str] = &["All files are correct", "repair is not required"];
/// Verify output meaning the data is damaged.
const DAMAGE_PATTERNS: &[&str] = &[
    "Repair is required",
    "Repair is possible",
    "Repair is not possible",
];
/// Output meaning no usable recovery data was found.
const NO_RECOVERY_PATTERNS: &[&str] = &[
    "No PAR2 recovery sets found",
    "Main packet not found",
    "recovery file does not exist",
    "Could not read",
];
const REPAIRED_PATTERNS: &[&str] = &["Repair complete", "All files are correct"];
const REPAIR_IMPOSSIBLE: &str = "Repair is not possible";

/// Nonzero-exit output that is still treated as success.
pub const ACCEPTABLE_WARNINGS: &[&str] = &["Skipping 0 byte file", "is empty and will not be"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Verify,
    Repair,
}

impl CheckKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Repair => "repair",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub status: ItemStatus,
    pub details: String,
    pub damaged_targets: Vec<String>,
    pub missing_targets: Vec<String>,
    /// Additional recovery blocks par2 asked for, when repair was impossible.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocks_needed: Option<u64>,
}

impl Classification {
    fn new(status: ItemStatus, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
            damaged_targets: Vec::new(),
            missing_targets: Vec::new(),
            blocks_needed: None,
        }
    }

    /// Error form of an UNKNOWN classification.
    #[must_use]
    pub fn unknown_error(&self, kind: CheckKind) -> Option<VaultError> {
        (self.status == ItemStatus::Unknown).then(|| VaultError::ClassificationUnknown {
            kind: kind.as_str().to_owned(),
            excerpt: self.details.clone(),
        })
    }
}

fn target_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Target: "([^"]+)" - (damaged|missing)"#).expect("valid target regex")
    })
}

fn blocks_needed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"You need (\d+) more recovery blocks?").expect("valid blocks regex")
    })
}

fn contains_any(output: &str, patterns: &[&str]) -> bool {
    let lowered = output.to_ascii_lowercase();
    patterns
        .iter()
        .any(|pattern| lowered.contains(&pattern.to_ascii_lowercase()))
}

fn targets(output: &str) -> (Vec<String>, Vec<String>) {
    let mut damaged = Vec::new();
    let mut missing = Vec::new();
    for captures in target_re().captures_iter(output) {
        let name = captures[1].to_owned();
        let bucket = if &captures[2] == "damaged" {
            &mut damaged
        } else {
            &mut missing
        };
        if !bucket.contains(&name) {
            bucket.push(name);
        }
    }
    (damaged, missing)
}

fn excerpt(output: &str) -> String {
    let trimmed = output.trim();
    match trimmed.char_indices().nth(EXCERPT_CHARS) {
        Some((cut, _)) => format!("{}...", &trimmed[..cut]),
        None => trimmed.to_owned(),
    }
}

fn target_summary(damaged: &[String], missing: &[String]) -> String {
    let mut summary = String::new();
    if !damaged.is_empty() {
        let _ = write!(summary, "{} damaged: {}", damaged.len(), damaged.join(", "));
    }
    if !missing.is_empty() {
        if !summary.is_empty() {
            summary.push_str("; ");
        }
        let _ = write!(summary, "{} missing: {}", missing.len(), missing.join(", "));
    }
    summary
}

/// Classify the combined output of one par2 run.
#[must_use]
pub fn classify(output: &str, kind: CheckKind) -> Classification {
    let classification = match kind {
        CheckKind::Verify => classify_verify(output),
        CheckKind::Repair => classify_repair(output),
    };
    if classification.status == ItemStatus::Unknown {
        warn!(
            target: "parvault.classifier",
            kind = kind.as_str(),
            output = %classification.details,
            "par2 output matched no known pattern"
        );
    }
    classification
}

fn classify_verify(output: &str) -> Classification {
    let (damaged, missing) = targets(output);

    if contains_any(output, INTACT_PATTERNS) {
        return Classification::new(ItemStatus::Protected, "All files are correct");
    }
    if contains_any(output, DAMAGE_PATTERNS) {
        let summary = target_summary(&damaged, &missing);
        let details = if summary.is_empty() {
            "Repair is required".to_owned()
        } else {
            summary
        };
        return Classification {
            damaged_targets: damaged,
            missing_targets: missing,
            ..Classification::new(ItemStatus::Damaged, details)
        };
    }
    if !missing.is_empty() {
        return Classification {
            details: target_summary(&damaged, &missing),
            damaged_targets: damaged,
            missing_targets: missing,
            ..Classification::new(ItemStatus::Missing, "")
        };
    }
    if contains_any(output, NO_RECOVERY_PATTERNS) {
        return Classification::new(
            ItemStatus::Error,
            format!("No usable recovery data: {}", excerpt(output)),
        );
    }
    Classification::new(ItemStatus::Unknown, excerpt(output))
}

fn classify_repair(output: &str) -> Classification {
    let (damaged, missing) = targets(output);
    let with_targets = |status, details: String| Classification {
        damaged_targets: damaged.clone(),
        missing_targets: missing.clone(),
        ..Classification::new(status, details)
    };

    if contains_any(output, REPAIRED_PATTERNS) {
        return with_targets(ItemStatus::Repaired, "Repair complete".to_owned());
    }
    if let Some(captures) = blocks_needed_re().captures(output) {
        let needed = captures[1].parse::<u64>().ok();
        let mut classification = with_targets(
            ItemStatus::Missing,
            format!(
                "Repair is not possible: {} more recovery blocks needed",
                &captures[1]
            ),
        );
        classification.blocks_needed = needed;
        return classification;
    }
    if contains_any(output, &[REPAIR_IMPOSSIBLE]) {
        return with_targets(ItemStatus::RepairFailed, "Repair is not possible".to_owned());
    }
    with_targets(ItemStatus::Error, excerpt(output))
}

/// Repair classification with exit status promotion: a zero exit without a
/// repair-impossible pattern counts as REPAIRED.
#[must_use]
pub fn classify_repair_run(output: &str, exit_status: Option<i32>) -> Classification {
    let mut classification = classify(output, CheckKind::Repair);
    if exit_status == Some(0)
        && matches!(classification.status, ItemStatus::Error | ItemStatus::Unknown)
    {
        classification.status = ItemStatus::Repaired;
        classification.details = "Repair complete".to_owned();
    }
    classification
}

/// Whether a nonzero exit with this output may be treated as success.
#[must_use]
pub fn is_acceptable_warning(output: &str) -> bool {
    ACCEPTABLE_WARNINGS
        .iter()
        .any(|pattern| output.contains(pattern))
}

// UNKNOWN ranks with ERROR; REPAIR_FAILED sits in the same tier above them.
const fn severity(status: ItemStatus) -> u8 {
    match status {
        ItemStatus::Damaged => 5,
        ItemStatus::Missing => 4,
        ItemStatus::RepairFailed => 3,
        ItemStatus::Error | ItemStatus::Unknown => 2,
        ItemStatus::Repaired => 1,
        ItemStatus::Protected => 0,
    }
}

/// Fold per-set classifications into one: DAMAGED > MISSING > ERROR >
/// (REPAIRED | PROTECTED). Details keep a per-set breakdown.
#[must_use]
pub fn reduce(results: &[(String, Classification)]) -> Classification {
    let Some(worst) = results
        .iter()
        .map(|(_, classification)| classification.status)
        .max_by_key(|status| severity(*status))
    else {
        return Classification::new(ItemStatus::Error, "no parity sets were checked");
    };
    let status = if worst == ItemStatus::Unknown {
        ItemStatus::Error
    } else {
        worst
    };

    let mut reduced = Classification::new(status, String::new());
    let mut breakdown = Vec::with_capacity(results.len());
    for (label, classification) in results {
        reduced
            .damaged_targets
            .extend(classification.damaged_targets.iter().cloned());
        reduced
            .missing_targets
            .extend(classification.missing_targets.iter().cloned());
        if let Some(needed) = classification.blocks_needed {
            reduced.blocks_needed = Some(reduced.blocks_needed.unwrap_or(0) + needed);
        }
        breakdown.push(format!(
            "{label}: {} ({})",
            classification.status, classification.details
        ));
    }
    reduced.details = if results.len() == 1 {
        results[0].1.details.clone()
    } else {
        breakdown.join("\n")
    };
    reduced
}
