//! The `simulate` subcommand: one scenario, one config, one run.

use std::path::Path;

use vigil_core::config::{self, Config, LoadedConfig};
use vigil_core::error::PipelineError;
use vigil_core::pipeline::{Pipeline, RunOptions};

use crate::SimulateArgs;

pub fn run(args: &SimulateArgs) -> Result<(), PipelineError> {
    let loaded = load_config_with_overrides(
        &args.config,
        args.policy_pack.as_deref(),
        args.approver_id.as_deref(),
        args.approver_token.as_deref(),
    )?;

    let mut pipeline = Pipeline::new(loaded);
    if let Some(mode) = &args.ingest_mode {
        pipeline = pipeline.with_ingest_mode(mode.parse()?);
    }

    let summary = pipeline.run(&RunOptions {
        scenario_path: args.scenario.clone(),
        out_dir: args.out.clone(),
    })?;

    if summary.cancelled {
        println!("run {} cancelled", summary.run_id);
    } else {
        println!(
            "run {}: {} events, {} approved, {} pending, {} risk-held",
            summary.run_id,
            summary.events,
            summary.approved_tasks,
            summary.pending_tasks,
            summary.risk_held_tasks
        );
    }
    Ok(())
}

/// Loads a config, merging the policy pack and injecting CLI approver
/// credentials before typed parsing.
pub fn load_config_with_overrides(
    config_path: &Path,
    policy_pack: Option<&Path>,
    approver_id: Option<&str>,
    approver_token: Option<&str>,
) -> Result<LoadedConfig, PipelineError> {
    let raw = std::fs::read_to_string(config_path).map_err(|err| {
        PipelineError::Config(format!("cannot read config {}: {err}", config_path.display()))
    })?;
    let mut value: serde_yaml::Value = serde_yaml::from_str(&raw).map_err(|err| {
        PipelineError::Config(format!("invalid YAML in {}: {err}", config_path.display()))
    })?;

    if let Some(pack) = policy_pack {
        let pack_raw = std::fs::read_to_string(pack).map_err(|err| {
            PipelineError::Config(format!("cannot read policy pack {}: {err}", pack.display()))
        })?;
        let overlay: serde_yaml::Value = serde_yaml::from_str(&pack_raw).map_err(|err| {
            PipelineError::Config(format!("invalid YAML in {}: {err}", pack.display()))
        })?;
        config::deep_merge(&mut value, overlay);
    }

    match (approver_id, approver_token) {
        (Some(id), Some(token)) => config::inject_active_approver(&mut value, id, token),
        (None, None) => {}
        _ => {
            return Err(PipelineError::Config(
                "--approver-id and --approver-token must be given together".to_string(),
            ));
        }
    }

    Config::from_value(value)
}
