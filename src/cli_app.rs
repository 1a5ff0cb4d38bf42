//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use thiserror::Error;

use ban_lurker::core::config::Config;
use ban_lurker::daemon::signals::SignalHandler;
use ban_lurker::daemon::soak::{SoakOptions, SoakReport, SoakRunner};

/// Ban lurker: background invalidation of cached objects against the ban list.
#[derive(Debug, Parser)]
#[command(
    name = "lurker",
    author,
    version,
    about = "Ban lurker - lazy ban evaluation driver",
    long_about = None,
    arg_required_else_help = true
)]
/// Top-level command line.
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the lurker against a synthetic cache and report counters.
    Soak(SoakArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
}

#[derive(Debug, Clone, Args)]
struct SoakArgs {
    /// How long to run.
    #[arg(long, default_value_t = 10, value_name = "SECONDS")]
    duration: u64,
    /// Resident object population.
    #[arg(long, default_value_t = 10_000, value_name = "N")]
    objects: usize,
    /// Variants sharing one object head.
    #[arg(long, default_value_t = 4, value_name = "N")]
    variants: usize,
    /// Concurrent request threads.
    #[arg(long, default_value_t = 4, value_name = "N")]
    threads: usize,
    /// Interval between ban insertions.
    #[arg(long, default_value_t = 50, value_name = "MILLISECONDS")]
    ban_interval_ms: u64,
    /// Distinct tag values.
    #[arg(long, default_value_t = 64, value_name = "N")]
    tags: u32,
    /// RNG seed.
    #[arg(long, default_value_t = 0x5eed)]
    seed: u64,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    /// Config operation to run.
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print resolved config file path.
    Path,
    /// Print effective merged configuration.
    Show,
    /// Validate configuration and exit.
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input at runtime.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Json(_) => 3,
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    match &cli.command {
        Command::Soak(args) => run_soak(cli, args),
        Command::Config(args) => run_config(cli, args),
    }
}

fn run_soak(cli: &Cli, args: &SoakArgs) -> Result<(), CliError> {
    let config =
        Config::load(cli.config.as_deref()).map_err(|e| CliError::User(e.to_string()))?;
    let options = SoakOptions {
        duration: Duration::from_secs(args.duration),
        objects: args.objects,
        variants_per_head: args.variants,
        request_threads: args.threads,
        ban_interval: Duration::from_millis(args.ban_interval_ms.max(1)),
        tags: args.tags,
        seed: args.seed,
    };
    let report = SoakRunner::new(config, options, SignalHandler::new())
        .run()
        .map_err(|e| CliError::Runtime(e.to_string()))?;

    match output_mode(cli) {
        OutputMode::Human => print_soak_human(&report),
        OutputMode::Json => {
            let payload = json!({
                "command": "soak",
                "report": serde_json::to_value(&report)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn print_soak_human(report: &SoakReport) {
    let b = &report.bans;
    println!("Soak finished after {:.1}s", report.elapsed_secs);
    println!(
        "  lurker:   {} cycles, {} passes, {} bans reaped",
        report.lurker.cycles, report.lurker.passes, report.lurker.bans_reaped
    );
    println!(
        "  bans:     {} live ({} added, {} deleted, {} completed, {} dups)",
        b.bans, b.bans_added, b.bans_deleted, b.bans_completed, b.bans_dups
    );
    println!(
        "  lurking:  {} objects tested, {} tests, {} killed, {} contention, {} aborted",
        b.bans_lurker_tested,
        b.bans_lurker_tests_tested,
        b.bans_lurker_obj_killed,
        b.bans_lurker_contention,
        b.bans_lurker_aborted
    );
    println!(
        "  requests: {} served, {} banned on lookup, {} expired by lurker",
        report.requests, report.banned_on_lookup, report.expired
    );
    println!("  resident: {} objects", report.resident_objects);
    if report.trace_records_dropped > 0 {
        println!("  trace:    {} records dropped", report.trace_records_dropped);
    }
}

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())
                .map_err(|e| CliError::Runtime(e.to_string()))?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = config
                        .to_toml()
                        .map_err(|e| CliError::Runtime(e.to_string()))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config
                    .stable_hash()
                    .map_err(|e| CliError::Runtime(e.to_string()))?;
                let source = config
                    .config_file
                    .as_ref()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default();

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {source}");
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": source,
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => eprintln!("Configuration is INVALID: {e}"),
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("LURKER_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
