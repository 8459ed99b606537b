//! Export: writes run artifacts to the configured sinks.
//!
//! Sinks are independent: a failure in one is audited as `export_failed`
//! with the sink name and error category, and never prevents the other
//! sinks from running. Whole-file artifacts are written atomically
//! (temp-then-rename); the JSONL effectors append with optional size-based
//! rollover.

mod http;
mod jsonl;

use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

pub use http::HttpPoster;
pub use jsonl::JsonlEffector;

use crate::audit::AuditLog;
use crate::config::ExportConfig;
use crate::error::PipelineError;
use crate::metrics::Metrics;
use crate::types::{Event, TaskRecommendation};

/// Errors raised by individual export sinks. Recoverable: the run
/// continues, the failure is audited.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ExportError {
    /// Filesystem failure in a sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be serialized.
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink is named in `formats` but its section is missing.
    #[error("sink '{0}' is not configured")]
    NotConfigured(&'static str),

    /// An HTTP target kept failing after all retries.
    #[error("external service error: {0}")]
    External(String),
}

impl ExportError {
    /// Coarse error category recorded in `export_failed` audit entries.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Serialize(_) => "serialize",
            Self::NotConfigured(_) => "config",
            Self::External(_) => "external_service",
        }
    }
}

/// The full artifact payload exported by a run.
#[derive(Debug, Clone, Serialize)]
pub struct ExportPayload {
    /// Artifact schema version from config.
    pub schema_version: String,

    /// ISO-8601 timestamp fixed when the payload is assembled.
    pub generated_at: String,

    /// Events in rule-emission order, post-governance.
    pub events: Vec<Event>,

    /// Approved tasks in decision order, post-guardrails.
    pub tasks: Vec<TaskRecommendation>,

    /// Tasks awaiting approval.
    pub pending_tasks: Vec<TaskRecommendation>,

    /// Tasks rolled back by risk budgets.
    pub risk_held_tasks: Vec<TaskRecommendation>,
}

impl ExportPayload {
    /// Assembles a payload, stamping `generated_at` now.
    #[must_use]
    pub fn new(
        schema_version: String,
        events: Vec<Event>,
        tasks: Vec<TaskRecommendation>,
        pending_tasks: Vec<TaskRecommendation>,
        risk_held_tasks: Vec<TaskRecommendation>,
    ) -> Self {
        Self {
            schema_version,
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            events,
            tasks,
            pending_tasks,
            risk_held_tasks,
        }
    }
}

/// External STIX bundle serializer seam.
///
/// The serializer itself is an external collaborator; when none is wired
/// the `stix` sink audits `export_skipped`.
pub trait StixSerializer: Send + Sync {
    /// Produces a STIX bundle for the payload.
    ///
    /// # Errors
    ///
    /// Returns an export error when the bundle cannot be produced.
    fn serialize_bundle(&self, payload: &ExportPayload) -> Result<serde_json::Value, ExportError>;
}

/// Runs every configured sink, auditing per-sink failures.
///
/// Returns the paths written, keyed by sink token.
///
/// # Errors
///
/// Only fails if an audit append fails; sink errors are recoverable.
pub fn run(
    cfg: &ExportConfig,
    payload: &ExportPayload,
    metrics: &Metrics,
    stix: Option<&dyn StixSerializer>,
    out_dir: &Path,
    audit: &AuditLog,
) -> Result<BTreeMap<String, String>, PipelineError> {
    let mut paths = BTreeMap::new();

    for sink in &cfg.formats {
        let result = match sink.as_str() {
            "json" => sink_json(payload, out_dir).map(Some),
            "stdout" => sink_stdout(payload).map(|()| None),
            "metrics" => sink_metrics(metrics, out_dir).map(Some),
            "stix" => match stix {
                Some(serializer) => sink_stix(serializer, payload, out_dir).map(Some),
                None => {
                    audit.append("export_skipped", json!({"sink": "stix"}))?;
                    Ok(None)
                }
            },
            "task_jsonl" => sink_task_jsonl(cfg, payload).map(Some),
            "infrastructure" => sink_infrastructure(cfg, payload).map(Some),
            "webhook" => sink_webhook(cfg, payload).map(|()| None),
            // Unknown tokens are rejected at config load.
            other => Err(ExportError::External(format!("unknown sink '{other}'"))),
        };

        match result {
            Ok(Some(path)) => {
                paths.insert(sink.clone(), path.display().to_string());
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(sink = %sink, error = %err, "export sink failed");
                audit.append(
                    "export_failed",
                    json!({"sink": sink, "category": err.category(), "error": err.to_string()}),
                )?;
            }
        }
    }

    Ok(paths)
}

fn sink_json(payload: &ExportPayload, out_dir: &Path) -> Result<PathBuf, ExportError> {
    let path = out_dir.join("events.json");
    let body = serde_json::to_string_pretty(payload)?;
    write_atomic(&path, body.as_bytes())?;
    Ok(path)
}

fn sink_stdout(payload: &ExportPayload) -> Result<(), ExportError> {
    let body = serde_json::to_string_pretty(payload)?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(body.as_bytes())?;
    stdout.write_all(b"\n")?;
    Ok(())
}

fn sink_metrics(metrics: &Metrics, out_dir: &Path) -> Result<PathBuf, ExportError> {
    let path = out_dir.join("metrics.prom");
    write_atomic(&path, metrics.render_prometheus().as_bytes())?;
    Ok(path)
}

fn sink_stix(
    serializer: &dyn StixSerializer,
    payload: &ExportPayload,
    out_dir: &Path,
) -> Result<PathBuf, ExportError> {
    let bundle = serializer.serialize_bundle(payload)?;
    let path = out_dir.join("stix_bundle.json");
    write_atomic(&path, serde_json::to_string_pretty(&bundle)?.as_bytes())?;
    Ok(path)
}

fn sink_task_jsonl(cfg: &ExportConfig, payload: &ExportPayload) -> Result<PathBuf, ExportError> {
    let sink_cfg = cfg
        .task_jsonl
        .as_ref()
        .ok_or(ExportError::NotConfigured("task_jsonl"))?;
    let effector = JsonlEffector::new(&sink_cfg.path, sink_cfg.rotate_max_bytes);
    let rows: Vec<serde_json::Value> = payload
        .tasks
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;
    effector.emit(&rows)?;
    Ok(sink_cfg.path.clone())
}

fn sink_infrastructure(cfg: &ExportConfig, payload: &ExportPayload) -> Result<PathBuf, ExportError> {
    let sink_cfg = cfg
        .infrastructure
        .as_ref()
        .ok_or(ExportError::NotConfigured("infrastructure"))?;
    let rows: Vec<serde_json::Value> = payload
        .tasks
        .iter()
        .filter(|t| t.is_infrastructure())
        .map(serde_json::to_value)
        .collect::<Result<_, _>>()?;

    let effector = JsonlEffector::new(&sink_cfg.path, sink_cfg.rotate_max_bytes);
    effector.emit(&rows)?;

    if let Some(http_cfg) = &sink_cfg.http {
        if !rows.is_empty() {
            let poster = HttpPoster::new(http_cfg)?;
            poster.post_json(&serde_json::Value::Array(rows))?;
        }
    }
    Ok(sink_cfg.path.clone())
}

fn sink_webhook(cfg: &ExportConfig, payload: &ExportPayload) -> Result<(), ExportError> {
    let http_cfg = cfg
        .webhook
        .as_ref()
        .ok_or(ExportError::NotConfigured("webhook"))?;
    let poster = HttpPoster::new(http_cfg)?;
    poster.post_json(&serde_json::to_value(payload)?)
}

/// Writes a whole file atomically: temp file in the same directory, then
/// rename over the target.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
