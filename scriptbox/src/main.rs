//! Sandboxed rule-patch script runner.
//!
//! Validates scripts statically, or evaluates them in an isolated worker and
//! prints the captured ops, logs and output as JSON.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::debug;

use scriptbox::core::types::EvalOutput;
use scriptbox::core::validator::validate_with;
use scriptbox::io::config::{SandboxConfig, load_config, write_config};
use scriptbox::{ErrorKind, SandboxError, Session, exit_codes, logging};

const DEFAULT_CONFIG: &str = "scriptbox.toml";

#[derive(Parser)]
#[command(
    name = "scriptbox",
    version,
    about = "Validate and run untrusted rule-patch scripts in a sandbox"
)]
struct Cli {
    /// Sandbox configuration (TOML). Defaults apply when the file is missing.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a config file holding the default limits to `--config`.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Statically check a script and print the findings.
    Validate {
        /// Script file.
        file: PathBuf,
    },
    /// Evaluate a script and print its ops, logs and output.
    Eval {
        /// Script file.
        file: PathBuf,
    },
    /// Evaluate a set of modules, starting from `--entry`.
    EvalModule {
        /// Entry module name, as one of the given paths.
        #[arg(long)]
        entry: String,
        /// Module files, keyed by the path as given.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
        Command::Validate { file } => cmd_validate(&load_config(&cli.config)?, &file),
        Command::Eval { file } => cmd_eval(load_config(&cli.config)?, &file).await,
        Command::EvalModule { entry, files } => {
            cmd_eval_module(load_config(&cli.config)?, &entry, &files).await
        }
    }
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    write_config(path, &SandboxConfig::default(), force)?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(config: &SandboxConfig, file: &Path) -> Result<i32> {
    let source = read_source(file)?;
    let result = validate_with(&source, &config.validator);
    print_json(&result)?;
    Ok(if result.ok() {
        exit_codes::OK
    } else {
        exit_codes::INVALID
    })
}

async fn cmd_eval(config: SandboxConfig, file: &Path) -> Result<i32> {
    let source = read_source(file)?;
    let session = Session::spawn(config)?;
    let outcome = session.evaluate(&source).await;
    session.dispose();
    report(outcome)
}

async fn cmd_eval_module(config: SandboxConfig, entry: &str, files: &[PathBuf]) -> Result<i32> {
    let modules = files
        .iter()
        .map(|file| Ok((file.to_string_lossy().into_owned(), read_source(file)?)))
        .collect::<Result<Vec<_>>>()?;
    debug!(modules = modules.len(), entry, "evaluating modules");
    let session = Session::spawn(config)?;
    let outcome = session.evaluate_module(entry, modules).await;
    session.dispose();
    report(outcome)
}

/// Print the output (or the error) and map it to an exit code.
fn report(outcome: Result<EvalOutput, SandboxError>) -> Result<i32> {
    match outcome {
        Ok(output) => {
            print_json(&output)?;
            Ok(exit_codes::OK)
        }
        Err(err) => {
            for line in err.logs() {
                eprintln!("[script] {line}");
            }
            eprintln!("{err}");
            Ok(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &SandboxError) -> i32 {
    match err.kind() {
        ErrorKind::Validation | ErrorKind::ModuleResolution => exit_codes::INVALID,
        ErrorKind::RuntimeFault => exit_codes::FAULT,
        ErrorKind::Initialization | ErrorKind::Disposal => exit_codes::ERROR,
    }
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    println!("{payload}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_eval_module() {
        let cli = Cli::parse_from([
            "scriptbox",
            "eval-module",
            "--entry",
            "main.js",
            "main.js",
            "lib/a.js",
        ]);
        match cli.command {
            Command::EvalModule { entry, files } => {
                assert_eq!(entry, "main.js");
                assert_eq!(files.len(), 2);
            }
            _ => panic!("expected eval-module"),
        }
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
    }

    #[test]
    fn parse_global_config_after_subcommand() {
        let cli = Cli::parse_from(["scriptbox", "validate", "a.js", "--config", "box.toml"]);
        assert!(matches!(cli.command, Command::Validate { .. }));
        assert_eq!(cli.config, PathBuf::from("box.toml"));
    }

    #[test]
    fn parse_init_config() {
        let cli = Cli::parse_from(["scriptbox", "init-config", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true }));
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(
            exit_code_for(&SandboxError::ModuleNotFound {
                entry: "x".to_string()
            }),
            exit_codes::INVALID
        );
        assert_eq!(
            exit_code_for(&SandboxError::Runtime {
                message: "boom".to_string(),
                logs: Vec::new(),
            }),
            exit_codes::FAULT
        );
        assert_eq!(exit_code_for(&SandboxError::Disposed), exit_codes::ERROR);
    }
}
