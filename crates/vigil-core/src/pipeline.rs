//! The orchestrator: sequences stages over a shared per-run context.
//!
//! Stages run sequentially; all inter-stage data is passed as fully
//! materialized collections, and each stage's side effects are bracketed by
//! audit entries. Fatal errors write a final `run_failed` entry before the
//! run aborts; cancellation writes `run_cancelled` and leaves artifacts
//! produced so far in place.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::audit::AuditLog;
use crate::autonomy::{self, Plan};
use crate::config::{IngestMode, LoadedConfig};
use crate::decision;
use crate::error::PipelineError;
use crate::export::{self, ExportPayload, StixSerializer};
use crate::fusion;
use crate::governance;
use crate::guardrails;
use crate::ingest::{self, MediaAdapter};
use crate::metrics::Metrics;
use crate::risk::RiskStore;
use crate::rules::RuleSet;

/// Cooperative cancellation signal shared with blocking stages.
///
/// Tail polling observes it within one poll interval; the orchestrator
/// checks it between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-run inputs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Scenario document, required in `scenario` ingest mode.
    pub scenario_path: Option<PathBuf>,

    /// Output directory for artifacts.
    pub out_dir: PathBuf,
}

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    /// Unique id of this run.
    pub run_id: String,

    /// Events surviving governance.
    pub events: usize,

    /// Approved tasks surviving guardrails.
    pub approved_tasks: usize,

    /// Tasks awaiting approval.
    pub pending_tasks: usize,

    /// Tasks held by risk budgets.
    pub risk_held_tasks: usize,

    /// The per-domain plan.
    pub plan: Plan,

    /// Paths written by export sinks, keyed by sink token.
    pub artifact_paths: std::collections::BTreeMap<String, String>,

    /// Whether the run was cancelled mid-flight.
    pub cancelled: bool,
}

/// The oversight-enforced pipeline.
pub struct Pipeline {
    loaded: LoadedConfig,
    cancel: CancelToken,
    media: Option<Box<dyn MediaAdapter>>,
    stix: Option<Box<dyn StixSerializer>>,
    ingest_mode_override: Option<IngestMode>,
}

impl Pipeline {
    /// Creates a pipeline from a loaded configuration.
    #[must_use]
    pub fn new(loaded: LoadedConfig) -> Self {
        Self {
            loaded,
            cancel: CancelToken::new(),
            media: None,
            stix: None,
            ingest_mode_override: None,
        }
    }

    /// Wires the external media-modules adapter.
    #[must_use]
    pub fn with_media_adapter(mut self, adapter: Box<dyn MediaAdapter>) -> Self {
        self.media = Some(adapter);
        self
    }

    /// Wires the external STIX serializer.
    #[must_use]
    pub fn with_stix_serializer(mut self, serializer: Box<dyn StixSerializer>) -> Self {
        self.stix = Some(serializer);
        self
    }

    /// Overrides the configured ingest mode (CLI `--ingest-mode`).
    #[must_use]
    pub fn with_ingest_mode(mut self, mode: IngestMode) -> Self {
        self.ingest_mode_override = Some(mode);
        self
    }

    /// A handle that can cancel this pipeline from another thread.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Executes one full run.
    ///
    /// # Errors
    ///
    /// Returns the fatal error taxonomy of [`PipelineError`]; recoverable
    /// sink and service failures are audited instead.
    pub fn run(&self, opts: &RunOptions) -> Result<RunSummary, PipelineError> {
        std::fs::create_dir_all(&opts.out_dir)?;

        let cfg = &self.loaded.config;
        let audit_path = cfg
            .audit
            .path
            .clone()
            .unwrap_or_else(|| opts.out_dir.join("audit_log.jsonl"));
        let audit = AuditLog::open(&audit_path, &cfg.audit)?;

        match self.run_stages(opts, &audit) {
            Ok(summary) => Ok(summary),
            Err(err) => {
                // Best effort: the run is already failing.
                let _ = audit.append(
                    "run_failed",
                    json!({"category": err.category(), "error": err.to_string()}),
                );
                Err(err)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn run_stages(&self, opts: &RunOptions, audit: &AuditLog) -> Result<RunSummary, PipelineError> {
        let cfg = &self.loaded.config;
        let metrics = Metrics::new();
        let run_id = Uuid::new_v4().to_string();

        audit.append(
            "run_start",
            json!({
                "run_id": run_id,
                "schema_version": cfg.meta.schema_version,
                "config_hash": self.loaded.canonical_hash,
                "scenario": opts.scenario_path.as_ref().map(|p| p.display().to_string()),
            }),
        )?;
        tracing::info!(%run_id, config_hash = %self.loaded.canonical_hash, "run started");

        let risk_store_path = cfg
            .pipeline
            .guardrails
            .risk_store_path
            .clone()
            .unwrap_or_else(|| opts.out_dir.join("risk_store.sqlite3"));
        let risk_store = RiskStore::open(&risk_store_path)?;

        let rule_set = match &cfg.pipeline.rules_path {
            Some(path) => RuleSet::load(path)?,
            None => RuleSet::default(),
        };

        // Ingest.
        let mode = self.ingest_mode_override.unwrap_or(cfg.pipeline.ingest.mode);
        let readings = metrics.time("ingest", || {
            ingest::run(
                &cfg.pipeline.ingest,
                mode,
                opts.scenario_path.as_deref(),
                self.media.as_deref(),
                audit,
                &self.cancel,
            )
        })?;
        metrics.inc_by("readings_total", readings.len() as f64);
        if let Some(summary) = self.cancelled(&run_id, audit)? {
            return Ok(summary);
        }

        // Fusion.
        let fused = metrics.time("fusion", || fusion::run(&readings, audit))?;
        metrics.inc_by("tracks_total", fused.tracks.len() as f64);

        // Rules.
        let events = metrics.time("rules", || rule_set.evaluate(&readings))?;
        audit.append("rules_done", json!({"events": events.len()}))?;
        metrics.inc_by("events_total", events.len() as f64);

        // Governance, pre-decision.
        let filtered =
            governance::filter_events(&cfg.pipeline.governance, events, audit)?;
        if let Some(summary) = self.cancelled(&run_id, audit)? {
            return Ok(summary);
        }

        // Decision.
        let decided = metrics.time("decision", || {
            decision::run(
                &filtered.events,
                &cfg.pipeline.rbac,
                &cfg.pipeline.human_loop,
                &cfg.pipeline.infrastructure,
                audit,
            )
        })?;
        metrics.inc_by("tasks_approved", decided.approved.len() as f64);
        metrics.inc_by("tasks_pending", decided.pending.len() as f64);

        // Governance, post-decision (forbidden actions never export).
        let approved =
            governance::filter_tasks(&cfg.pipeline.governance, decided.approved, audit)?;
        let pending =
            governance::filter_tasks(&cfg.pipeline.governance, decided.pending, audit)?;

        // Guardrails and risk budgets.
        let guarded = metrics.time("guardrails", || {
            guardrails::run(
                &cfg.pipeline.guardrails,
                approved,
                &filtered.events,
                &risk_store,
                audit,
                Utc::now().timestamp(),
            )
        })?;
        metrics.inc_by("guardrail_dropped", guarded.dropped as f64);
        metrics.inc_by("tasks_risk_held", guarded.risk_held.len() as f64);
        if let Some(summary) = self.cancelled(&run_id, audit)? {
            return Ok(summary);
        }

        // Autonomy.
        let plan = autonomy::plan(&guarded.kept, audit)?;

        // Export.
        let payload = ExportPayload::new(
            cfg.meta.schema_version.clone(),
            filtered.events,
            guarded.kept,
            pending,
            guarded.risk_held,
        );
        let artifact_paths = metrics.time("export", || {
            export::run(
                &cfg.pipeline.export,
                &payload,
                &metrics,
                self.stix.as_deref(),
                &opts.out_dir,
                audit,
            )
        })?;
        audit.append("export_done", json!({"paths": artifact_paths}))?;

        audit.append(
            "run_end",
            json!({
                "events": payload.events.len(),
                "tasks": payload.tasks.len(),
                "pending": payload.pending_tasks.len(),
                "risk_held": payload.risk_held_tasks.len(),
            }),
        )?;
        tracing::info!(
            %run_id,
            events = payload.events.len(),
            tasks = payload.tasks.len(),
            "run complete"
        );

        Ok(RunSummary {
            run_id,
            events: payload.events.len(),
            approved_tasks: payload.tasks.len(),
            pending_tasks: payload.pending_tasks.len(),
            risk_held_tasks: payload.risk_held_tasks.len(),
            plan,
            artifact_paths,
            cancelled: false,
        })
    }

    /// Writes `run_cancelled` and short-circuits when cancellation was
    /// requested.
    fn cancelled(
        &self,
        run_id: &str,
        audit: &AuditLog,
    ) -> Result<Option<RunSummary>, PipelineError> {
        if !self.cancel.is_cancelled() {
            return Ok(None);
        }
        audit.append("run_cancelled", json!({"run_id": run_id}))?;
        tracing::warn!(%run_id, "run cancelled");
        Ok(Some(RunSummary {
            run_id: run_id.to_string(),
            events: 0,
            approved_tasks: 0,
            pending_tasks: 0,
            risk_held_tasks: 0,
            plan: Plan::default(),
            artifact_paths: std::collections::BTreeMap::new(),
            cancelled: true,
        }))
    }
}
