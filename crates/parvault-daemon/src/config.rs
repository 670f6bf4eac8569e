use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::hash::BuildHasher;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use parvault_core::{VaultError, VaultResult};
use parvault_durability::ParityConfig;
use parvault_storage::{RetryPolicy, StorageConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Source precedence, highest first.
pub const PRECEDENCE: [ConfigSource; 4] = [
    ConfigSource::Cli,
    ConfigSource::Env,
    ConfigSource::File,
    ConfigSource::Defaults,
];

const APP_DIR: &str = "parvault";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageSection {
    pub db_path: String,
    pub wal_mode: bool,
    pub busy_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for StorageSection {
    fn default() -> Self {
        let defaults = StorageConfig::default();
        Self {
            db_path: default_db_path().to_string_lossy().into_owned(),
            wal_mode: defaults.wal_mode,
            busy_timeout_ms: defaults.busy_timeout_ms,
            retry: defaults.retry,
        }
    }
}

impl StorageSection {
    #[must_use]
    pub fn to_storage_config(&self) -> StorageConfig {
        StorageConfig {
            db_path: PathBuf::from(&self.db_path),
            wal_mode: self.wal_mode,
            busy_timeout_ms: self.busy_timeout_ms,
            retry: self.retry,
        }
    }
}

/// Admission limits and sampling cadence of the resource monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub max_cpu_percent: f64,
    pub max_memory_percent: f64,
    pub max_io_percent: f64,
    /// Throughput treated as 100% I/O load.
    pub io_reference_mb_s: f64,
    pub cpu_interval_ms: u64,
    pub memory_interval_ms: u64,
    pub io_interval_ms: u64,
    pub history_size: usize,
    pub adaptive_limits: bool,
    /// Claims between adaptive recalculations.
    pub adaptive_interval: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_percent: 85.0,
            max_io_percent: 70.0,
            io_reference_mb_s: 200.0,
            cpu_interval_ms: 5_000,
            memory_interval_ms: 5_000,
            io_interval_ms: 5_000,
            history_size: 60,
            adaptive_limits: false,
            adaptive_interval: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessorConfig {
    pub max_concurrent_operations: usize,
    pub poll_interval_ms: u64,
    /// Exit after this long with an empty queue (background mode only).
    pub idle_exit_secs: u64,
    /// Terminal queue rows older than this are purged at startup.
    pub retention_days: u64,
    pub pid_file: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: 2,
            poll_interval_ms: 1_000,
            idle_exit_secs: 30,
            retention_days: 7,
            pid_file: default_pid_file().to_string_lossy().into_owned(),
        }
    }
}

impl ProcessorConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn idle_exit(&self) -> Duration {
        Duration::from_secs(self.idle_exit_secs)
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days.saturating_mul(24 * 60 * 60))
    }
}

/// Defaults for the metadata flags of enqueued operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataConfig {
    pub capture_on_protect: bool,
    pub verify_on_verify: bool,
    pub auto_restore: bool,
    pub restore_after_repair: bool,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            capture_on_protect: true,
            verify_on_verify: false,
            auto_restore: false,
            restore_after_repair: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VaultConfig {
    pub storage: StorageSection,
    pub parity: ParityConfig,
    pub resources: ResourceConfig,
    pub processor: ProcessorConfig,
    pub metadata: MetadataConfig,
    /// Category name to file extensions for individual-files protection.
    pub categories: BTreeMap<String, Vec<String>>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            storage: StorageSection::default(),
            parity: ParityConfig::default(),
            resources: ResourceConfig::default(),
            processor: ProcessorConfig::default(),
            metadata: MetadataConfig::default(),
            categories: default_categories(),
        }
    }
}

impl VaultConfig {
    /// Extensions configured for `category`.
    #[must_use]
    pub fn category_extensions(&self, category: &str) -> Option<&[String]> {
        self.categories.get(category).map(Vec::as_slice)
    }
}

fn default_categories() -> BTreeMap<String, Vec<String>> {
    let entry = |name: &str, exts: &[&str]| {
        (
            name.to_owned(),
            exts.iter().map(|ext| (*ext).to_owned()).collect::<Vec<_>>(),
        )
    };
    BTreeMap::from([
        entry("video", &["mkv", "mp4", "avi", "m4v", "mov", "ts"]),
        entry("audio", &["flac", "mp3", "m4a", "ogg", "wav"]),
        entry("photos", &["jpg", "jpeg", "png", "heic", "raw", "cr2", "nef"]),
        entry("documents", &["pdf", "doc", "docx", "odt", "txt", "md"]),
    ])
}

#[must_use]
pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("parvault.sqlite3")
}

#[must_use]
pub fn default_pid_file() -> PathBuf {
    dirs::runtime_dir()
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("run")))
        .unwrap_or_else(std::env::temp_dir)
        .join("parvault-processor.pid")
}

#[must_use]
pub fn default_config_file_path(home_dir: &Path) -> PathBuf {
    if let Some(xdg_config_home) = std::env::var_os("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg_config_home)
            .join(APP_DIR)
            .join("config.toml");
    }
    home_dir.join(".config").join(APP_DIR).join("config.toml")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConfigSource {
    Cli,
    Env,
    File,
    Defaults,
    Runtime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigWarning {
    pub reason_code: String,
    pub field: String,
    pub source: ConfigSource,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLoadResult {
    pub config: VaultConfig,
    pub config_file_used: Option<PathBuf>,
    pub cli_flags_used: Vec<String>,
    pub env_keys_used: Vec<String>,
    pub warnings: Vec<ConfigWarning>,
}

/// Overrides taken from global CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub par2_binary: Option<PathBuf>,
    pub max_concurrent: Option<usize>,
}

impl CliOverrides {
    #[must_use]
    pub fn used_flags(&self) -> Vec<String> {
        [
            (self.config_path.is_some(), "--config"),
            (self.db_path.is_some(), "--db"),
            (self.par2_binary.is_some(), "--par2"),
            (self.max_concurrent.is_some(), "--max-concurrent"),
        ]
        .into_iter()
        .filter(|(used, _)| *used)
        .map(|(_, flag)| flag.to_owned())
        .collect()
    }
}

/// Load config with precedence `CLI > env > file > defaults`.
///
/// A missing file is not an error; the defaults apply.
pub fn load_from_sources<S: BuildHasher>(
    config_file: Option<&Path>,
    env: &HashMap<String, String, S>,
    cli: &CliOverrides,
    home_dir: &Path,
) -> VaultResult<ConfigLoadResult> {
    let (contents, used) = match config_file {
        Some(path) if path.exists() => (Some(fs::read_to_string(path)?), Some(path)),
        Some(_) | None => (None, None),
    };
    load_from_str(contents.as_deref(), used, env, cli, home_dir)
}

pub fn load_from_str<S: BuildHasher>(
    config_toml: Option<&str>,
    config_file_path: Option<&Path>,
    env: &HashMap<String, String, S>,
    cli: &CliOverrides,
    home_dir: &Path,
) -> VaultResult<ConfigLoadResult> {
    let mut warnings = Vec::new();
    let mut config = match config_toml {
        Some(raw) => {
            warnings.extend(collect_unknown_key_warnings(raw)?);
            toml::from_str::<VaultConfig>(raw).map_err(|error| VaultError::InvalidConfig {
                field: "config_file".into(),
                value: "<toml>".into(),
                reason: error.to_string(),
            })?
        }
        None => VaultConfig::default(),
    };

    let env_keys_used = apply_env_overrides(&mut config, env)?;
    apply_cli_overrides(&mut config, cli);
    expand_tilde_paths(&mut config, home_dir);
    validate_config(&mut config, &mut warnings)?;

    Ok(ConfigLoadResult {
        config,
        config_file_used: config_file_path.map(Path::to_path_buf),
        cli_flags_used: cli.used_flags(),
        env_keys_used,
        warnings,
    })
}

pub fn emit_config_loaded(result: &ConfigLoadResult) {
    for warning in &result.warnings {
        warn!(
            target: "parvault.config",
            reason_code = %warning.reason_code,
            field = %warning.field,
            "{}",
            warning.message
        );
    }
    info!(
        target: "parvault.config",
        precedence = ?PRECEDENCE,
        config_file_used = ?result.config_file_used,
        cli_flags_used = ?result.cli_flags_used,
        env_keys_used = ?result.env_keys_used,
        db_path = %result.config.storage.db_path,
        "configuration loaded"
    );
}

fn apply_env_overrides(
    config: &mut VaultConfig,
    env: &HashMap<String, String, impl BuildHasher>,
) -> VaultResult<Vec<String>> {
    let mut used = Vec::new();
    let mut take = |key: &str| {
        let value = env.get(key).cloned();
        if value.is_some() {
            used.push(key.to_owned());
        }
        value
    };

    if let Some(value) = take("PARVAULT_DB_PATH") {
        config.storage.db_path = value;
    }
    if let Some(value) = take("PARVAULT_PAR2_BINARY") {
        config.parity.binary = PathBuf::from(value);
    }
    if let Some(value) = take("PARVAULT_PARITY_DIR") {
        config.parity.parity_dir_name = value;
    }
    if let Some(value) = take("PARVAULT_DEFAULT_REDUNDANCY") {
        config.parity.default_redundancy = parse_number(&value, "parity.default_redundancy")?;
    }
    if let Some(value) = take("PARVAULT_CPU_LIMIT") {
        config.parity.cpu_limit_percent = parse_number(&value, "parity.cpu_limit_percent")?;
    }
    if let Some(value) = take("PARVAULT_DEBUG") {
        config.parity.debug = parse_bool(&value, "parity.debug")?;
    }
    if let Some(value) = take("PARVAULT_MAX_CONCURRENT") {
        config.processor.max_concurrent_operations =
            parse_number(&value, "processor.max_concurrent_operations")?;
    }
    if let Some(value) = take("PARVAULT_POLL_INTERVAL_MS") {
        config.processor.poll_interval_ms = parse_number(&value, "processor.poll_interval_ms")?;
    }
    if let Some(value) = take("PARVAULT_IDLE_EXIT_SECS") {
        config.processor.idle_exit_secs = parse_number(&value, "processor.idle_exit_secs")?;
    }
    if let Some(value) = take("PARVAULT_PID_FILE") {
        config.processor.pid_file = value;
    }
    if let Some(value) = take("PARVAULT_MAX_CPU_PERCENT") {
        config.resources.max_cpu_percent = parse_number(&value, "resources.max_cpu_percent")?;
    }
    if let Some(value) = take("PARVAULT_MAX_MEMORY_PERCENT") {
        config.resources.max_memory_percent =
            parse_number(&value, "resources.max_memory_percent")?;
    }
    if let Some(value) = take("PARVAULT_MAX_IO_PERCENT") {
        config.resources.max_io_percent = parse_number(&value, "resources.max_io_percent")?;
    }
    if let Some(value) = take("PARVAULT_ADAPTIVE_LIMITS") {
        config.resources.adaptive_limits = parse_bool(&value, "resources.adaptive_limits")?;
    }

    Ok(used)
}

fn apply_cli_overrides(config: &mut VaultConfig, cli: &CliOverrides) {
    if let Some(db_path) = &cli.db_path {
        config.storage.db_path = db_path.to_string_lossy().into_owned();
    }
    if let Some(binary) = &cli.par2_binary {
        config.parity.binary.clone_from(binary);
    }
    if let Some(max_concurrent) = cli.max_concurrent {
        config.processor.max_concurrent_operations = max_concurrent;
    }
}

fn collect_unknown_key_warnings(config_toml: &str) -> VaultResult<Vec<ConfigWarning>> {
    let value: toml::Value =
        toml::from_str(config_toml).map_err(|error| VaultError::InvalidConfig {
            field: "config_file".into(),
            value: "<toml>".into(),
            reason: error.to_string(),
        })?;
    let root = value.as_table().ok_or_else(|| VaultError::InvalidConfig {
        field: "config_file".into(),
        value: "<toml>".into(),
        reason: "expected table at root".into(),
    })?;

    let mut warnings = Vec::new();
    let unknown = |field: String, message: String| ConfigWarning {
        reason_code: "config.unknown_key.warning".into(),
        field,
        source: ConfigSource::File,
        message,
    };

    for (section, section_value) in root {
        let known: HashSet<&str> = match section.as_str() {
            "storage" => ["db_path", "wal_mode", "busy_timeout_ms", "retry"].into(),
            "parity" => [
                "binary",
                "parity_dir_name",
                "default_redundancy",
                "cpu_limit_percent",
                "memory_limit_mb",
                "block_count",
                "block_size",
                "target_size_mb",
                "recovery_file_count",
                "debug",
                "max_args",
                "batch_strategy",
                "batch_size",
                "max_runtime_secs",
                "terminate_grace_ms",
            ]
            .into(),
            "resources" => [
                "max_cpu_percent",
                "max_memory_percent",
                "max_io_percent",
                "io_reference_mb_s",
                "cpu_interval_ms",
                "memory_interval_ms",
                "io_interval_ms",
                "history_size",
                "adaptive_limits",
                "adaptive_interval",
            ]
            .into(),
            "processor" => [
                "max_concurrent_operations",
                "poll_interval_ms",
                "idle_exit_secs",
                "retention_days",
                "pid_file",
            ]
            .into(),
            "metadata" => [
                "capture_on_protect",
                "verify_on_verify",
                "auto_restore",
                "restore_after_repair",
            ]
            .into(),
            // Free-form category names.
            "categories" => continue,
            _ => {
                warnings.push(unknown(
                    format!("config.{section}"),
                    format!("Unknown section {section} ignored"),
                ));
                continue;
            }
        };
        let Some(table) = section_value.as_table() else {
            continue;
        };
        for key in table.keys() {
            if !known.contains(key.as_str()) {
                warnings.push(unknown(
                    format!("{section}.{key}"),
                    format!("Unknown key {section}.{key} ignored"),
                ));
            }
        }
    }
    Ok(warnings)
}

fn expand_tilde_paths(config: &mut VaultConfig, home_dir: &Path) {
    if let Some(expanded) = expand_tilde(&config.storage.db_path, home_dir) {
        config.storage.db_path = expanded;
    }
    if let Some(expanded) = expand_tilde(&config.processor.pid_file, home_dir) {
        config.processor.pid_file = expanded;
    }
    if let Some(expanded) = expand_tilde(&config.parity.binary.to_string_lossy(), home_dir) {
        config.parity.binary = PathBuf::from(expanded);
    }
}

fn expand_tilde(value: &str, home_dir: &Path) -> Option<String> {
    if value == "~" {
        return Some(home_dir.to_string_lossy().into_owned());
    }
    value
        .strip_prefix("~/")
        .map(|rest| home_dir.join(rest).to_string_lossy().into_owned())
}

fn validate_config(config: &mut VaultConfig, warnings: &mut Vec<ConfigWarning>) -> VaultResult<()> {
    config.parity.validate()?;

    if config.storage.db_path.trim().is_empty() {
        return Err(invalid("storage.db_path", "", "must not be empty"));
    }
    let resources = &config.resources;
    for (field, value) in [
        ("resources.max_cpu_percent", resources.max_cpu_percent),
        ("resources.max_memory_percent", resources.max_memory_percent),
        ("resources.max_io_percent", resources.max_io_percent),
    ] {
        if !(value > 0.0 && value <= 100.0) {
            return Err(invalid(field, &value.to_string(), "must be in (0, 100]"));
        }
    }
    if resources.io_reference_mb_s <= 0.0 || !resources.io_reference_mb_s.is_finite() {
        return Err(invalid(
            "resources.io_reference_mb_s",
            &resources.io_reference_mb_s.to_string(),
            "must be a positive throughput",
        ));
    }
    if resources.history_size == 0 {
        return Err(invalid("resources.history_size", "0", "must be at least 1"));
    }
    if config.processor.max_concurrent_operations == 0 {
        return Err(invalid(
            "processor.max_concurrent_operations",
            "0",
            "must be at least 1",
        ));
    }
    if config.processor.poll_interval_ms == 0 {
        return Err(invalid("processor.poll_interval_ms", "0", "must be positive"));
    }

    let mut normalized = BTreeMap::new();
    for (name, extensions) in std::mem::take(&mut config.categories) {
        match parvault_core::normalize_file_types(&extensions) {
            Some(extensions) => {
                normalized.insert(name, extensions);
            }
            None => warnings.push(ConfigWarning {
                reason_code: "config.categories.empty".into(),
                field: format!("categories.{name}"),
                source: ConfigSource::Runtime,
                message: format!("Category {name} has no extensions and was dropped"),
            }),
        }
    }
    config.categories = normalized;
    Ok(())
}

fn invalid(field: &str, value: &str, reason: &str) -> VaultError {
    VaultError::InvalidConfig {
        field: field.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

fn parse_bool(value: &str, field: &str) -> VaultResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(
            field,
            value,
            "expected boolean (true/false/1/0/yes/no/on/off)",
        )),
    }
}

fn parse_number<T: FromStr>(value: &str, field: &str) -> VaultResult<T> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| invalid(field, value, "expected a number"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;

    use parvault_core::VaultError;

    use super::*;

    fn home() -> &'static Path {
        Path::new("/home/tester")
    }

    fn load(toml: Option<&str>, env: &[(&str, &str)], cli: &CliOverrides) -> VaultResult<ConfigLoadResult> {
        let env: HashMap<String, String> = env
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        load_from_str(toml, None, &env, cli, home())
    }

    #[test]
    fn defaults_are_valid() {
        let result = load(None, &[], &CliOverrides::default()).expect("defaults");
        assert_eq!(result.config.processor.max_concurrent_operations, 2);
        assert_eq!(result.config.parity.parity_dir_name, ".parity");
        assert!(result.config.category_extensions("video").is_some());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn precedence_is_cli_then_env_then_file_then_defaults() {
        let file = "[processor]\nmax_concurrent_operations = 4\npoll_interval_ms = 250\n\
                    [parity]\nbinary = \"/opt/par2\"\ncpu_limit_percent = 50\n";
        let result = load(
            Some(file),
            &[("PARVAULT_MAX_CONCURRENT", "3"), ("PARVAULT_CPU_LIMIT", "25")],
            &CliOverrides {
                max_concurrent: Some(1),
                ..CliOverrides::default()
            },
        )
        .expect("load");
        let config = &result.config;
        assert_eq!(config.processor.max_concurrent_operations, 1, "cli wins");
        assert_eq!(config.parity.cpu_limit_percent, 25, "env beats file");
        assert_eq!(config.processor.poll_interval_ms, 250, "file beats default");
        assert_eq!(config.parity.binary, PathBuf::from("/opt/par2"));
        assert_eq!(config.parity.default_redundancy, 10, "untouched default");
        assert_eq!(
            result.env_keys_used,
            vec!["PARVAULT_CPU_LIMIT", "PARVAULT_MAX_CONCURRENT"]
        );
        assert_eq!(result.cli_flags_used, vec!["--max-concurrent"]);
    }

    #[test]
    fn unknown_keys_are_reported_as_warnings() {
        let file = "[parity]\nredundncy = 5\n[telemetry]\nenabled = true\n\
                    [categories]\nbooks = [\"epub\", \".PDF\"]\n";
        let result = load(Some(file), &[], &CliOverrides::default()).expect("load");
        let fields: Vec<&str> = result.warnings.iter().map(|w| w.field.as_str()).collect();
        assert!(fields.contains(&"parity.redundncy"));
        assert!(fields.contains(&"config.telemetry"));
        assert_eq!(
            result.config.category_extensions("books"),
            Some(&["epub".to_owned(), "pdf".to_owned()][..])
        );
    }

    #[test]
    fn tilde_paths_are_expanded() {
        let file = "[storage]\ndb_path = \"~/vault/db.sqlite3\"\n";
        let result = load(Some(file), &[], &CliOverrides::default()).expect("load");
        assert_eq!(result.config.storage.db_path, "/home/tester/vault/db.sqlite3");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = load(Some("[resources]\nmax_cpu_percent = 0\n"), &[], &CliOverrides::default())
            .expect_err("zero limit");
        assert!(matches!(err, VaultError::InvalidConfig { ref field, .. } if field == "resources.max_cpu_percent"));

        let err = load(None, &[("PARVAULT_DEBUG", "maybe")], &CliOverrides::default())
            .expect_err("bad bool");
        assert!(err.to_string().contains("parity.debug"));

        let err = load(Some("[parity]\ndefault_redundancy = 0\n"), &[], &CliOverrides::default())
            .expect_err("zero redundancy");
        assert!(err.to_string().contains("default_redundancy"));
    }

    #[test]
    fn empty_category_is_dropped_with_warning() {
        let file = "[categories]\nempty = []\n";
        let result = load(Some(file), &[], &CliOverrides::default()).expect("load");
        assert!(result.config.category_extensions("empty").is_none());
        assert_eq!(result.warnings[0].reason_code, "config.categories.empty");
    }

    #[test]
    fn storage_section_converts_to_store_config() {
        let file = "[storage]\ndb_path = \"/var/lib/parvault/db\"\nbusy_timeout_ms = 250\n\
                    [storage.retry]\nmax_retries = 3\n";
        let result = load(Some(file), &[], &CliOverrides::default()).expect("load");
        let storage = result.config.storage.to_storage_config();
        assert_eq!(storage.db_path, PathBuf::from("/var/lib/parvault/db"));
        assert_eq!(storage.busy_timeout_ms, 250);
        assert_eq!(storage.retry.max_retries, 3);
        assert_eq!(storage.retry.initial_delay_ms, 50);
    }
}
