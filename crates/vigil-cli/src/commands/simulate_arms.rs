//! The `simulate-arms` subcommand: one scenario across multiple config
//! arms, with a per-arm output directory and a comparison summary.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use vigil_core::error::PipelineError;
use vigil_core::pipeline::{Pipeline, RunOptions};

use super::simulate::load_config_with_overrides;
use crate::SimulateArmsArgs;

pub fn run(args: &SimulateArmsArgs) -> Result<(), PipelineError> {
    let arms = parse_arm_specs(&args.arms)?;
    if arms.is_empty() {
        return Err(PipelineError::Config(
            "simulate-arms requires at least one --arm NAME:CONFIG_PATH".to_string(),
        ));
    }

    std::fs::create_dir_all(&args.out)?;
    let mut comparison = BTreeMap::new();

    for (name, config_path) in &arms {
        let loaded = load_config_with_overrides(
            config_path,
            None,
            args.approver_id.as_deref(),
            args.approver_token.as_deref(),
        )?;

        let arm_out = args.out.join(format!("arm_{name}"));
        let pipeline = Pipeline::new(loaded);
        pipeline.run(&RunOptions {
            scenario_path: args.scenario.clone(),
            out_dir: arm_out.clone(),
        })?;

        comparison.insert(
            name.clone(),
            json!({
                "config": config_path.display().to_string(),
                "out_dir": arm_out.display().to_string(),
                "summary": summarize_arm(&arm_out),
            }),
        );
    }

    let summary = json!({
        "scenario": args.scenario.as_ref().map(|p| p.display().to_string()),
        "arms": comparison,
    });
    let summary_path = args.out.join("comparison_summary.json");
    let body = serde_json::to_string_pretty(&summary)
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    std::fs::write(&summary_path, body.as_bytes())?;
    println!("wrote {}", summary_path.display());
    Ok(())
}

/// Parses repeated `NAME:CONFIG_PATH` arm specs, rejecting duplicates.
fn parse_arm_specs(specs: &[String]) -> Result<Vec<(String, PathBuf)>, PipelineError> {
    let mut arms = Vec::with_capacity(specs.len());
    let mut seen = std::collections::HashSet::new();

    for raw in specs {
        let Some((name, config_path)) = raw.split_once(':') else {
            return Err(PipelineError::Config(format!(
                "invalid --arm value '{raw}': expected NAME:CONFIG_PATH"
            )));
        };
        let name = name.trim();
        let config_path = config_path.trim();
        if name.is_empty() || config_path.is_empty() {
            return Err(PipelineError::Config(format!(
                "invalid --arm value '{raw}': expected NAME:CONFIG_PATH"
            )));
        }
        if !seen.insert(name.to_string()) {
            return Err(PipelineError::Config(format!("duplicate arm name '{name}'")));
        }
        arms.push((name.to_string(), PathBuf::from(config_path)));
    }
    Ok(arms)
}

/// Best-effort artifact counts for one arm's output directory.
fn summarize_arm(out_dir: &Path) -> Value {
    let mut summary = json!({
        "events": 0,
        "tasks": 0,
        "pending_tasks": 0,
        "risk_held_tasks": 0,
        "audit_entries": 0,
        "has_metrics": out_dir.join("metrics.prom").exists(),
    });

    if let Ok(raw) = std::fs::read_to_string(out_dir.join("events.json")) {
        if let Ok(data) = serde_json::from_str::<Value>(&raw) {
            let count = |key: &str| data[key].as_array().map_or(0, Vec::len);
            summary["events"] = json!(count("events"));
            summary["tasks"] = json!(count("tasks"));
            summary["pending_tasks"] = json!(count("pending_tasks"));
            summary["risk_held_tasks"] = json!(count("risk_held_tasks"));
        }
    }

    if let Ok(raw) = std::fs::read_to_string(out_dir.join("audit_log.jsonl")) {
        summary["audit_entries"] = json!(raw.lines().filter(|l| !l.trim().is_empty()).count());
    }

    summary
}
