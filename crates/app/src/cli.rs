use anyhow::Result;
use clap::{Parser, Subcommand};
use vision::{RunnerCliArgs, RunnerConfig};

/// Capture camera snapshots and run several detectors on each within a time budget.
#[derive(Debug, Parser)]
#[command(name = "detect-runner", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run detection cycles until the budget is spent.
    Run(RunnerCliArgs),
}

pub fn run() -> Result<()> {
    match Cli::parse().command {
        Command::Run(args) => {
            let config = RunnerConfig::try_from(args)?;
            vision::run(config)?;
            Ok(())
        }
    }
}
