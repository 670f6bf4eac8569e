use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Instant;

use parvault_core::{VaultError, VaultResult};
use parvault_daemon::{
    CliInput, OutputEnvelope, OutputMeta, ProcessorLauncher, VaultRuntime, Verbosity,
    default_config_file_path, emit_config_loaded, emit_json, exit_code, exit_code_for,
    forwarded_args, init_subscriber, load_from_sources, parse_cli_args,
};
use serde_json::Value;
use tracing::error;

fn main() {
    let started = Instant::now();
    let input = match parse_cli_args(std::env::args().skip(1)) {
        Ok(input) => input,
        Err(error) => {
            eprintln!("usage: parvault <run|enqueue|status|cancel|list|items|history> [flags]");
            finish("cli", Err(error), started);
        }
    };

    init_subscriber(Verbosity::from_flags(input.verbose, input.quiet), input.no_color);
    let command = input.command.name();
    let result = execute(&input);
    if let Err(error) = &result {
        error!(target: "parvault.cli", command, code = error.code(), error = %error, "command failed");
    }
    finish(command, result, started);
}

fn execute(input: &CliInput) -> VaultResult<Value> {
    let env: HashMap<String, String> = std::env::vars().collect();
    let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/"));

    let config_path = match &input.overrides.config_path {
        Some(path) if !path.exists() => {
            return Err(VaultError::InvalidConfig {
                field: "config_file".to_owned(),
                value: path.display().to_string(),
                reason: "explicitly provided --config path does not exist".to_owned(),
            });
        }
        Some(path) => path.clone(),
        None => default_config_file_path(&home_dir),
    };
    let loaded = load_from_sources(Some(&config_path), &env, &input.overrides, &home_dir)?;
    emit_config_loaded(&loaded);

    let launcher = ProcessorLauncher::current_exe(
        &loaded.config.processor.pid_file,
        forwarded_args(&input.overrides),
    )?;
    let runtime = VaultRuntime::open(loaded.config, launcher)?;
    runtime.execute(&input.command)
}

fn finish(command: &str, result: VaultResult<Value>, started: Instant) -> ! {
    let meta = OutputMeta {
        command: command.to_owned(),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    let (envelope, code) = match result {
        Ok(data) => (OutputEnvelope::success(data, meta), exit_code::OK),
        Err(error) => (
            OutputEnvelope::error((&error).into(), meta),
            exit_code_for(&error),
        ),
    };
    let mut stdout = io::stdout().lock();
    if emit_json(&envelope, &mut stdout).is_err() || stdout.flush().is_err() {
        std::process::exit(exit_code::FAILURE);
    }
    std::process::exit(code);
}
