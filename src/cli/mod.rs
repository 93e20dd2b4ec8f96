mod resources;
mod run;

pub use resources::{execute_setup, execute_teardown};
pub use run::execute_run;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::scenarios::Scenario;

#[derive(Parser)]
#[command(name = "functions-e2e")]
#[command(about = "Verify trigger and binding behavior of a running functions host")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run scenarios against the function host
    Run(RunArgs),
    /// List available scenarios
    List,
    /// Create the shared queues and containers
    Setup(ResourceArgs),
    /// Delete the shared queues and containers
    Teardown(ResourceArgs),
}

#[derive(clap::Args)]
pub struct ResourceArgs {
    /// Path to the config file (default: ./.functions-e2e.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Storage connection string, overrides the config file
    #[arg(long, env = crate::config::STORAGE_ENV, hide_env_values = true)]
    pub connection_string: Option<String>,

    /// Suffix appended to queue and container names
    #[arg(long)]
    pub suffix: Option<String>,
}

#[derive(clap::Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub resources: ResourceArgs,

    /// Scenario to run (repeatable). Runs all scenarios when omitted.
    #[arg(long = "scenario", short = 's', value_parser = parse_scenario)]
    pub scenarios: Vec<Scenario>,

    /// Launch the host process from [host] instead of using one already running
    #[arg(long)]
    pub start_host: bool,

    /// Leave queues and containers in place after the run
    #[arg(long)]
    pub keep_resources: bool,

    /// Poll timeout in milliseconds, overrides [poll] timeout_ms
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Write a JSON summary of the results to this path
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn parse_scenario(name: &str) -> Result<Scenario, String> {
    Scenario::from_name(name).ok_or_else(|| {
        let known: Vec<_> = Scenario::all().iter().map(Scenario::name).collect();
        format!("unknown scenario '{}'. Available: {}", name, known.join(", "))
    })
}

pub fn execute_list() {
    for scenario in Scenario::all() {
        println!("{:<28} {}", scenario.name(), scenario.description());
    }
}
