use std::ffi::OsString;
use std::path::PathBuf;
use std::str::FromStr;

use parvault_core::{OperationKind, OperationParams, VaultError, VaultResult};

use crate::config::CliOverrides;

pub const DEFAULT_LIST_LIMIT: usize = 20;
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// `parvault` subcommands.
#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run { foreground: bool },
    Enqueue { kind: OperationKind, params: OperationParams },
    Status { operation_id: i64 },
    Cancel { operation_id: i64 },
    List { active: bool, limit: usize },
    Items { path: Option<PathBuf> },
    History { item_id: i64, limit: usize },
}

impl CliCommand {
    pub const ALL_NAMES: [&'static str; 7] =
        ["run", "enqueue", "status", "cancel", "list", "items", "history"];

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Run { .. } => "run",
            Self::Enqueue { .. } => "enqueue",
            Self::Status { .. } => "status",
            Self::Cancel { .. } => "cancel",
            Self::List { .. } => "list",
            Self::Items { .. } => "items",
            Self::History { .. } => "history",
        }
    }
}

/// Parsed CLI input: the command plus global flags.
#[derive(Debug, Clone, PartialEq)]
pub struct CliInput {
    pub command: CliCommand,
    pub overrides: CliOverrides,
    pub verbose: bool,
    pub quiet: bool,
    pub no_color: bool,
}

/// Parse `parvault` arguments (without the program name).
///
/// The first token names the command. Positional arguments and command
/// flags follow; global flags may appear anywhere.
pub fn parse_cli_args<I, S>(args: I) -> VaultResult<CliInput>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tokens: Vec<String> = args.into_iter().map(Into::into).collect();
    let Some(name) = tokens.first() else {
        return Err(usage("", "expected a command"));
    };
    if name.starts_with('-') {
        return Err(usage(name, "expected a command before flags"));
    }

    let mut overrides = CliOverrides::default();
    let (mut verbose, mut quiet, mut no_color) = (false, false, false);
    let mut positional: Vec<String> = Vec::new();
    let mut local = LocalFlags::default();

    let mut idx = 1;
    while idx < tokens.len() {
        let flag = tokens[idx].as_str();
        match flag {
            "--config" => {
                overrides.config_path = Some(PathBuf::from(expect_value(&tokens, idx, flag)?));
                idx += 2;
            }
            "--db" => {
                overrides.db_path = Some(PathBuf::from(expect_value(&tokens, idx, flag)?));
                idx += 2;
            }
            "--par2" => {
                overrides.par2_binary = Some(PathBuf::from(expect_value(&tokens, idx, flag)?));
                idx += 2;
            }
            "--max-concurrent" => {
                let value = expect_value(&tokens, idx, flag)?;
                overrides.max_concurrent =
                    Some(parse_number(value, "processor.max_concurrent_operations")?);
                idx += 2;
            }
            "-v" | "--verbose" => {
                verbose = true;
                idx += 1;
            }
            "-q" | "--quiet" => {
                quiet = true;
                idx += 1;
            }
            "--no-color" => {
                no_color = true;
                idx += 1;
            }
            _ if flag.starts_with('-') => idx += local.take(&tokens, idx)?,
            _ => {
                positional.push(flag.to_owned());
                idx += 1;
            }
        }
    }

    let command = build_command(name, &positional, local)?;
    Ok(CliInput {
        command,
        overrides,
        verbose,
        quiet,
        no_color,
    })
}

/// Global flags a launched processor must inherit.
#[must_use]
pub fn forwarded_args(overrides: &CliOverrides) -> Vec<OsString> {
    let mut args = Vec::new();
    if let Some(path) = &overrides.config_path {
        args.extend(["--config".into(), path.clone().into_os_string()]);
    }
    if let Some(path) = &overrides.db_path {
        args.extend(["--db".into(), path.clone().into_os_string()]);
    }
    if let Some(path) = &overrides.par2_binary {
        args.extend(["--par2".into(), path.clone().into_os_string()]);
    }
    if let Some(max) = overrides.max_concurrent {
        args.extend(["--max-concurrent".into(), max.to_string().into()]);
    }
    args
}

#[derive(Debug, Default)]
struct LocalFlags {
    foreground: bool,
    active: bool,
    limit: Option<usize>,
    params: OperationParams,
    /// Flags seen, for rejecting ones the command does not take.
    seen: Vec<String>,
}

impl LocalFlags {
    /// Consume one command flag starting at `idx`; returns tokens used.
    fn take(&mut self, tokens: &[String], idx: usize) -> VaultResult<usize> {
        let flag = tokens[idx].as_str();
        let used = match flag {
            "--foreground" => {
                self.foreground = true;
                1
            }
            "--active" => {
                self.active = true;
                1
            }
            "--limit" => {
                self.limit = Some(parse_number(expect_value(tokens, idx, flag)?, "limit")?);
                2
            }
            "--path" => {
                self.params.path = Some(PathBuf::from(expect_value(tokens, idx, flag)?));
                2
            }
            "--id" => {
                self.params.id = Some(parse_number(expect_value(tokens, idx, flag)?, "id")?);
                2
            }
            "--redundancy" => {
                self.params.redundancy =
                    Some(parse_number(expect_value(tokens, idx, flag)?, "redundancy")?);
                2
            }
            "--file-types" => {
                self.params.file_types = Some(split_csv(expect_value(tokens, idx, flag)?)?);
                2
            }
            "--category" => {
                self.params.category = Some(expect_value(tokens, idx, flag)?.to_owned());
                2
            }
            "--capture-metadata" => {
                self.params.capture_metadata = true;
                1
            }
            "--verify-metadata" => {
                self.params.verify_metadata = true;
                1
            }
            "--auto-restore" => {
                self.params.auto_restore_metadata = true;
                1
            }
            "--force" => {
                self.params.force = true;
                1
            }
            "--keep-parity" => {
                self.params.delete_parity = Some(false);
                1
            }
            _ => {
                return Err(VaultError::InvalidConfig {
                    field: "cli.flag".into(),
                    value: flag.into(),
                    reason: "unsupported flag".into(),
                });
            }
        };
        self.seen.push(flag.to_owned());
        Ok(used)
    }

    fn allow_only(&self, command: &str, allowed: &[&str]) -> VaultResult<()> {
        match self.seen.iter().find(|flag| !allowed.contains(&flag.as_str())) {
            Some(flag) => Err(VaultError::InvalidConfig {
                field: "cli.flag".into(),
                value: flag.clone(),
                reason: format!("unsupported flag for `{command}`"),
            }),
            None => Ok(()),
        }
    }
}

const ENQUEUE_FLAGS: &[&str] = &[
    "--path",
    "--id",
    "--redundancy",
    "--file-types",
    "--category",
    "--capture-metadata",
    "--verify-metadata",
    "--auto-restore",
    "--force",
    "--keep-parity",
];

fn build_command(name: &str, positional: &[String], local: LocalFlags) -> VaultResult<CliCommand> {
    let command = match name {
        "run" => {
            local.allow_only(name, &["--foreground"])?;
            expect_positionals(name, positional, 0)?;
            CliCommand::Run {
                foreground: local.foreground,
            }
        }
        "enqueue" => {
            local.allow_only(name, ENQUEUE_FLAGS)?;
            expect_positionals(name, positional, 1)?;
            let kind = OperationKind::from_str(&positional[0])?;
            CliCommand::Enqueue {
                kind,
                params: local.params,
            }
        }
        "status" | "cancel" => {
            local.allow_only(name, &[])?;
            expect_positionals(name, positional, 1)?;
            let operation_id = parse_number(&positional[0], "operation_id")?;
            if name == "status" {
                CliCommand::Status { operation_id }
            } else {
                CliCommand::Cancel { operation_id }
            }
        }
        "list" => {
            local.allow_only(name, &["--active", "--limit"])?;
            expect_positionals(name, positional, 0)?;
            CliCommand::List {
                active: local.active,
                limit: local.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            }
        }
        "items" => {
            local.allow_only(name, &["--path"])?;
            expect_positionals(name, positional, 0)?;
            CliCommand::Items {
                path: local.params.path,
            }
        }
        "history" => {
            local.allow_only(name, &["--limit"])?;
            expect_positionals(name, positional, 1)?;
            CliCommand::History {
                item_id: parse_number(&positional[0], "item_id")?,
                limit: local.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
            }
        }
        _ => {
            return Err(VaultError::InvalidConfig {
                field: "cli.command".into(),
                value: name.into(),
                reason: format!("expected {}", CliCommand::ALL_NAMES.join("|")),
            });
        }
    };
    Ok(command)
}

fn expect_positionals(command: &str, positional: &[String], count: usize) -> VaultResult<()> {
    if positional.len() == count {
        return Ok(());
    }
    Err(usage(
        command,
        &format!("expected {count} positional argument(s), got {}", positional.len()),
    ))
}

fn usage(value: &str, reason: &str) -> VaultError {
    VaultError::InvalidConfig {
        field: "cli".into(),
        value: value.into(),
        reason: reason.into(),
    }
}

fn expect_value<'a>(tokens: &'a [String], idx: usize, flag: &str) -> VaultResult<&'a str> {
    tokens
        .get(idx + 1)
        .map(String::as_str)
        .ok_or_else(|| VaultError::InvalidConfig {
            field: "cli.flag".into(),
            value: flag.into(),
            reason: "missing value".into(),
        })
}

fn split_csv(value: &str) -> VaultResult<Vec<String>> {
    let parts: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|segment| !segment.is_empty())
        .map(str::to_string)
        .collect();
    if parts.is_empty() {
        return Err(VaultError::InvalidConfig {
            field: "cli.csv".into(),
            value: value.into(),
            reason: "expected at least one comma-separated value".into(),
        });
    }
    Ok(parts)
}

fn parse_number<T: FromStr>(value: &str, field: &str) -> VaultResult<T> {
    value.parse::<T>().map_err(|_| VaultError::InvalidConfig {
        field: field.into(),
        value: value.into(),
        reason: "expected a number".into(),
    })
}
