mod client;
mod config;
mod consistency;
mod corpus;
mod diagnostics;
mod env;
mod error;
mod fixture;
mod log;
mod process;
mod report;
mod runner;
mod saved_state;
mod scenario;
mod server;
mod verify;
mod wait;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use config::{HarnessConfig, StrategyKind};
use report::ReportFormat;
use scenario::Suite;

#[derive(Parser)]
#[command(
    name = "hh-harness",
    version,
    about = "Saved-state integration harness for hh_server/hh_client",
    long_about = "Builds a saved state once from a fixed corpus, then runs incremental scenarios against fresh servers that load it, comparing text and JSON client output with literal expectations."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (default: $HH_HARNESS_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the saved state and run scenarios
    Run {
        /// hh_server binary
        #[arg(long)]
        server: Option<PathBuf>,

        /// hh_client binary
        #[arg(long)]
        client: Option<PathBuf>,

        /// How the server is told to load the saved state
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// TOML scenario file (replaces the built-in suite)
        #[arg(long)]
        scenarios: Option<PathBuf>,

        /// Also run the built-in suite when --scenarios is given
        #[arg(long)]
        with_builtin: bool,

        /// Only run scenarios whose name contains this (repeatable)
        #[arg(short, long)]
        filter: Vec<String>,

        /// Scenarios to run in parallel
        #[arg(short, long)]
        jobs: Option<usize>,

        /// Report format: text, json
        #[arg(long, default_value = "text")]
        format: ReportFormat,

        /// Per-invocation timeout in seconds (0 disables)
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// List scenario names
    List {
        /// TOML scenario file (replaces the built-in suite)
        #[arg(long)]
        scenarios: Option<PathBuf>,

        /// Also list the built-in suite when --scenarios is given
        #[arg(long)]
        with_builtin: bool,
    },

    /// Show or create configuration file
    Config {
        /// Create default config file
        #[arg(long)]
        init: bool,
    },
}

fn load_suite(scenarios: Option<&Path>, with_builtin: bool) -> Result<Suite> {
    let suite = match scenarios {
        None => Suite::builtin()?,
        Some(path) if with_builtin => Suite::builtin()?.merge(Suite::from_path(path)?)?,
        Some(path) => Suite::from_path(path)?,
    };
    suite.validate()?;
    Ok(suite)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    log::set_verbosity(cli.verbose);

    match cli.command {
        Commands::Run {
            server,
            client,
            strategy,
            scenarios,
            with_builtin,
            filter,
            jobs,
            format,
            timeout,
        } => {
            let mut cfg = HarnessConfig::load(cli.config.as_deref())?;
            if server.is_some() {
                cfg.binaries.server = server;
            }
            if client.is_some() {
                cfg.binaries.client = client;
            }
            if let Some(strategy) = strategy {
                cfg.saved_state.strategy = strategy;
            }
            if let Some(jobs) = jobs {
                cfg.run.jobs = jobs.max(1);
            }
            if let Some(secs) = timeout {
                cfg.timing.invocation_timeout_secs = secs;
            }

            let suite = load_suite(scenarios.as_deref(), with_builtin)?.filter(&filter);
            if suite.scenarios.is_empty() {
                anyhow::bail!("No scenarios selected");
            }
            log::log(&format!(
                "{} scenario(s), strategy {}",
                suite.scenarios.len(),
                cfg.saved_state.strategy.label()
            ));

            let report = runner::run(&cfg, &suite)?;
            report.print(format)?;
            if !report.success() {
                std::process::exit(1);
            }
        }

        Commands::List {
            scenarios,
            with_builtin,
        } => {
            let suite = load_suite(scenarios.as_deref(), with_builtin)?;
            for s in &suite.scenarios {
                match &s.description {
                    Some(d) if cli.verbose > 0 => println!("{:<40} {}", s.name, d),
                    _ => println!("{}", s.name),
                }
            }
        }

        Commands::Config { init } => {
            if init {
                let path = HarnessConfig::create_default(cli.config.as_deref())?;
                println!("Created config: {}", path.display());
            } else {
                config::show_config(cli.config.as_deref())?;
            }
        }
    }

    Ok(())
}
