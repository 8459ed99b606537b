//! vigil - oversight-enforced incident simulation pipeline.
//!
//! CLI front-end for `vigil-core`: runs synthetic scenarios through the
//! ingest → rules → decision → guardrails → export pipeline and writes
//! artifacts plus a hash-chained audit log.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// vigil - oversight-enforced incident simulation pipeline
#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a synthetic scenario through the pipeline
    Simulate(SimulateArgs),

    /// Run one scenario across multiple config arms and compare
    #[command(name = "simulate-arms")]
    SimulateArms(SimulateArmsArgs),
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Path to the scenario YAML file
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Path to the config YAML file
    #[arg(long, default_value = "configs/default.yaml")]
    config: PathBuf,

    /// Output directory
    #[arg(long)]
    out: PathBuf,

    /// Policy pack YAML deep-merged onto the config
    #[arg(long)]
    policy_pack: Option<PathBuf>,

    /// Override the configured ingest mode
    #[arg(long, value_name = "scenario|tail|modules_media")]
    ingest_mode: Option<String>,

    /// Approver id for signed approvals
    #[arg(long)]
    approver_id: Option<String>,

    /// HMAC token for signed approvals
    #[arg(long)]
    approver_token: Option<String>,
}

#[derive(clap::Args, Debug)]
struct SimulateArmsArgs {
    /// Path to the scenario YAML file
    #[arg(long)]
    scenario: Option<PathBuf>,

    /// Output directory root for arm subdirectories
    #[arg(long)]
    out: PathBuf,

    /// Arm definition in NAME:CONFIG_PATH format; repeatable
    #[arg(long = "arm")]
    arms: Vec<String>,

    /// Approver id for signed approvals
    #[arg(long)]
    approver_id: Option<String>,

    /// HMAC token for signed approvals
    #[arg(long)]
    approver_token: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let result = match cli.command {
        Commands::Simulate(args) => commands::simulate::run(&args),
        Commands::SimulateArms(args) => commands::simulate_arms::run(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err}");
            u8::try_from(err.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
        }
    }
}
