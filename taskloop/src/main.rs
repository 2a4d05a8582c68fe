//! `taskloop` command-line entry point.
//!
//! Reads `taskloop.toml`, wires the command oracle and command actions into a
//! [`LoopRunner`] and prints the answer on stdout.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use taskloop::core::types::StopReason;
use taskloop::exit_codes;
use taskloop::io::command_oracle::CommandOracle;
use taskloop::io::config::{DEFAULT_CONFIG_FILE, LoopConfig, load_config, write_config};
use taskloop::io::progress::ProgressReporter;
use taskloop::io::registry::ActionRegistry;
use taskloop::logging;
use taskloop::looping::LoopRunner;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Bounded, oracle-guided task execution loop"
)]
struct Cli {
    /// Config file path.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default config file.
    Init {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
    /// Answer a query with the configured oracle and actions.
    Run {
        query: String,
        /// Session whose memory feeds the planner.
        #[arg(long)]
        session: Option<String>,
        /// Override `max_global_steps`.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Disable the status line.
        #[arg(long)]
        no_progress: bool,
    },
    /// List configured actions.
    Actions,
    /// Load and validate the config.
    Validate,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Init { force } => {
            init(&cli.config, force)?;
            println!("wrote {}", cli.config.display());
            Ok(exit_codes::OK)
        }
        Command::Run {
            query,
            session,
            max_steps,
            no_progress,
        } => {
            let config = with_max_steps(load_valid_config(&cli.config)?, max_steps)?;
            let show_progress = config.progress && !no_progress && std::io::stdout().is_terminal();
            run_query(config, &query, session, show_progress)
        }
        Command::Actions => {
            let config = load_valid_config(&cli.config)?;
            if config.actions.is_empty() {
                println!("no actions configured");
            }
            for action in &config.actions {
                println!("{}\t{}", action.name, action.description);
            }
            Ok(exit_codes::OK)
        }
        Command::Validate => {
            load_valid_config(&cli.config)?;
            println!("ok");
            Ok(exit_codes::OK)
        }
    }
}

fn init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &LoopConfig::default())
}

fn load_valid_config(path: &Path) -> Result<LoopConfig> {
    let config = load_config(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(config)
}

/// Apply a `--max-steps` override and revalidate.
fn with_max_steps(mut config: LoopConfig, max_steps: Option<u32>) -> Result<LoopConfig> {
    if let Some(max_steps) = max_steps {
        config.max_global_steps = max_steps;
        config
            .validate()
            .context("invalid --max-steps override")?;
    }
    Ok(config)
}

fn run_query(
    config: LoopConfig,
    query: &str,
    session: Option<String>,
    show_progress: bool,
) -> Result<i32> {
    let registry = ActionRegistry::from_config(
        &config.actions,
        config.action_timeout(),
        config.output_limit_bytes,
    );
    let oracle = CommandOracle::new(
        &config.oracle,
        config.oracle_timeout(),
        config.output_limit_bytes,
    )?;
    let progress = if show_progress {
        ProgressReporter::new()
    } else {
        ProgressReporter::disabled()
    };

    let mut runner = LoopRunner::new(config, Arc::new(oracle), registry)?.with_progress(progress);
    if let Some(session) = session {
        runner = runner.with_session(session);
    }

    let outcome = runner.run_outcome(query);
    runner.progress().close();
    if let Some(path) = &outcome.record_path {
        info!(path = %path.display(), "run record written");
    }
    println!("{}", outcome.answer.text);

    Ok(match outcome.stop {
        StopReason::Fatal => exit_codes::INVALID,
        _ if outcome.answer.partial => exit_codes::PARTIAL,
        _ => exit_codes::OK,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init() {
        let cli = Cli::parse_from(["taskloop", "init"]);
        assert!(matches!(cli.command, Command::Init { force: false }));
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["taskloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
    }

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "taskloop",
            "run",
            "price of SOL",
            "--session",
            "alice",
            "--max-steps",
            "3",
            "--no-progress",
            "--config",
            "custom.toml",
        ]);
        let Command::Run {
            query,
            session,
            max_steps,
            no_progress,
        } = cli.command
        else {
            panic!("expected run command");
        };
        assert_eq!(query, "price of SOL");
        assert_eq!(session.as_deref(), Some("alice"));
        assert_eq!(max_steps, Some(3));
        assert!(no_progress);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(DEFAULT_CONFIG_FILE);

        init(&path, false).expect("first init");
        assert!(init(&path, false).is_err());
        init(&path, true).expect("forced init");
        load_valid_config(&path).expect("default config is valid");
    }

    #[test]
    fn zero_step_override_is_rejected() {
        let cli = Cli::parse_from(["taskloop", "run", "q", "--max-steps", "0"]);
        let Command::Run { max_steps, .. } = cli.command else {
            panic!("expected run command");
        };
        let err = with_max_steps(LoopConfig::default(), max_steps).unwrap_err();
        assert!(format!("{err:#}").contains("--max-steps"));
    }

    #[test]
    fn step_override_replaces_global_budget() {
        let config = with_max_steps(LoopConfig::default(), Some(3)).expect("valid override");
        assert_eq!(config.max_global_steps, 3);

        let untouched = with_max_steps(LoopConfig::default(), None).expect("no override");
        assert_eq!(untouched.max_global_steps, LoopConfig::default().max_global_steps);
    }
}
