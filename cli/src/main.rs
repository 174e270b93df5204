//! testpilot: run the test orchestrator and inspect its persisted state.
//!
//! # Usage
//!
//! ```text
//! testpilot run --config testpilot.yaml --submissions ./submissions
//! testpilot state validate --config testpilot.yaml
//! testpilot state show
//! testpilot config show
//! ```
//!
//! Without `--config`, the file named by `TESTPILOT_CONFIG` is used, and
//! without either the built-in defaults apply.

mod signal;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::info;

use testpilot_core::queue::DirectoryPlanSource;
use testpilot_core::recovery::{load_state, validate_state_file};
use testpilot_core::types::config::OrchestratorConfig;
use testpilot_core::OrchestratorService;

const CONFIG_ENV: &str = "TESTPILOT_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "testpilot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug, Clone, Default)]
struct ConfigArg {
    /// YAML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator in the foreground until SIGINT or SIGTERM.
    Run {
        #[command(flatten)]
        config: ConfigArg,
        /// Directory of `*.json` plan submissions. Defaults to
        /// `<state_dir>/submissions`.
        #[arg(long)]
        submissions: Option<PathBuf>,
        /// Seconds between health summaries in the log.
        #[arg(long, default_value_t = 60)]
        report_every: u64,
    },
    /// Inspect the persisted recovery state.
    State {
        #[command(subcommand)]
        action: StateAction,
    },
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum StateAction {
    /// Check the state file for orphaned tests and counter mismatches.
    Validate {
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Summarize the plans and tests in the state file.
    Show {
        #[command(flatten)]
        config: ConfigArg,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the effective configuration as YAML.
    Show {
        #[command(flatten)]
        config: ConfigArg,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();
    if let Err(e) = dispatch(cli.command) {
        eprintln!("testpilot: {:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(command: Command) -> Result<()> {
    match command {
        Command::Run {
            config,
            submissions,
            report_every,
        } => {
            let config = load_config(&config)?;
            run(config, submissions, Duration::from_secs(report_every.max(1)))
        }
        Command::State { action } => match action {
            StateAction::Validate { config } => {
                let config = load_config(&config)?;
                let report = validate_state_file(&config.state_file())
                    .with_context(|| format!("validating {}", config.state_file().display()))?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                if !report.valid {
                    bail!("state file is inconsistent");
                }
                Ok(())
            }
            StateAction::Show { config } => {
                let config = load_config(&config)?;
                println!("{}", serde_json::to_string_pretty(&state_summary(&config))?);
                Ok(())
            }
        },
        Command::Config { action } => match action {
            ConfigAction::Show { config } => {
                let config = load_config(&config)?;
                print!("{}", config.to_yaml()?);
                Ok(())
            }
        },
    }
}

fn config_path(arg: &ConfigArg) -> Option<PathBuf> {
    arg.config
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
}

fn load_config(arg: &ConfigArg) -> Result<OrchestratorConfig> {
    match config_path(arg) {
        Some(path) => OrchestratorConfig::load(&path)
            .with_context(|| format!("loading config {}", path.display())),
        None => Ok(OrchestratorConfig::default()),
    }
}

fn run(config: OrchestratorConfig, submissions: Option<PathBuf>, report_every: Duration) -> Result<()> {
    let submissions = submissions.unwrap_or_else(|| config.state_dir.join("submissions"));
    std::fs::create_dir_all(&submissions)
        .with_context(|| format!("creating {}", submissions.display()))?;
    let source = Arc::new(DirectoryPlanSource::new(&submissions));
    let service = OrchestratorService::new(config, source)?;

    signal::install();
    if !service.start()? {
        bail!("orchestrator was already running");
    }
    info!(submissions = %submissions.display(), "watching for plan submissions");

    let mut last_report = Instant::now();
    while !signal::received() {
        std::thread::sleep(Duration::from_millis(200));
        if last_report.elapsed() >= report_every {
            last_report = Instant::now();
            let health = service.get_health_status();
            info!(
                status = ?health.status,
                active_tests = health.active_tests,
                queued_tests = health.queued_tests,
                available_environments = health.available_environments,
                degraded = health.degraded_mode,
                "health"
            );
        }
    }
    info!("shutdown signal received");
    service.stop();
    Ok(())
}

fn state_summary(config: &OrchestratorConfig) -> serde_json::Value {
    let loaded = load_state(&config.state_file(), &config.backup_file());
    let plans: Vec<serde_json::Value> = loaded
        .state
        .plans
        .values()
        .map(|p| {
            json!({
                "plan_id": p.plan_id,
                "status": p.status,
                "priority": p.priority,
                "total_tests": p.total_tests,
                "completed_tests": p.completed_tests,
                "failed_tests": p.failed_tests,
                "remaining_tests": p.remaining_tests(),
            })
        })
        .collect();
    json!({
        "state_file": path_string(&config.state_file()),
        "source": loaded.source,
        "timestamp": loaded.state.timestamp,
        "version": loaded.state.version,
        "plans": plans,
        "tests": loaded.state.tests.len(),
        "statistics": loaded.state.statistics,
        "load_errors": loaded.errors,
    })
}

fn path_string(path: &Path) -> String {
    path.display().to_string()
}
