//! Configuration loading, policy-pack merging, and validation.
//!
//! The configuration is a YAML document with sections
//! `pipeline.{ingest, governance, human_loop, rbac, guardrails,
//! infrastructure, export}` and `audit`, plus a rule file reference. A
//! policy pack is a second YAML document deep-merged onto the base config:
//! maps merge recursively, scalars and lists are replaced.
//!
//! The merged document's canonical hash is computed at load time and
//! recorded in the `run_start` audit entry, so a run can always be tied to
//! the exact policy it executed under.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;

use crate::canonical;
use crate::error::PipelineError;

/// Known export sink tokens; anything else in `export.formats` is a
/// `ConfigError`.
pub const KNOWN_SINKS: &[&str] = &[
    "json",
    "stdout",
    "metrics",
    "stix",
    "task_jsonl",
    "infrastructure",
    "webhook",
];

/// A parsed configuration together with the canonical hash of the merged
/// document it was built from.
#[derive(Debug)]
pub struct LoadedConfig {
    /// The typed configuration tree.
    pub config: Config,

    /// SHA-256 hex over the canonical JSON form of the merged document.
    pub canonical_hash: String,
}

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Artifact metadata.
    #[serde(default)]
    pub meta: MetaConfig,

    /// Pipeline stage configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Audit log configuration.
    #[serde(default)]
    pub audit: AuditConfig,
}

/// Artifact metadata stamped into `events.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct MetaConfig {
    /// Schema version written into exported artifacts.
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_schema_version() -> String {
    "0.3".to_string()
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            schema_version: default_schema_version(),
        }
    }
}

/// Configuration for the pipeline stages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineConfig {
    /// Path to the declarative rule file.
    #[serde(default)]
    pub rules_path: Option<PathBuf>,

    /// Ingest stage options.
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Governance policy.
    #[serde(default)]
    pub governance: GovernanceConfig,

    /// Human-in-the-loop approval policy.
    #[serde(default)]
    pub human_loop: HumanLoopConfig,

    /// Approver registry and signed-token policy.
    #[serde(default)]
    pub rbac: RbacConfig,

    /// Rate limits and risk budgets.
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Infrastructure task mappings.
    #[serde(default)]
    pub infrastructure: InfrastructureConfig,

    /// Export sink configuration.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Ingest mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMode {
    /// Parse a scenario document with a `sensor_readings` list.
    #[default]
    Scenario,
    /// Poll a line-delimited file with bounded tailing.
    Tail,
    /// Delegate to the external media-modules adapter.
    ModulesMedia,
}

impl IngestMode {
    /// The config-file token for this mode.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Scenario => "scenario",
            Self::Tail => "tail",
            Self::ModulesMedia => "modules_media",
        }
    }
}

impl std::str::FromStr for IngestMode {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scenario" => Ok(Self::Scenario),
            "tail" => Ok(Self::Tail),
            "modules_media" => Ok(Self::ModulesMedia),
            other => Err(PipelineError::Config(format!(
                "unknown ingest mode '{other}' (expected scenario|tail|modules_media)"
            ))),
        }
    }
}

/// Ingest stage options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IngestConfig {
    /// Which producer feeds the run.
    #[serde(default)]
    pub mode: IngestMode,

    /// Tail-mode options.
    #[serde(default)]
    pub tail: TailConfig,

    /// Media adapter options.
    #[serde(default)]
    pub media: MediaConfig,

    /// Media module toggles, passed through to the adapter.
    #[serde(default)]
    pub modules: ModulesConfig,
}

/// Bounded tail polling options.
#[derive(Debug, Clone, Deserialize)]
pub struct TailConfig {
    /// File to poll for newline-delimited JSON readings.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Stop after this many readings.
    #[serde(default = "default_tail_max_items")]
    pub max_items: usize,

    /// Poll interval in seconds.
    #[serde(default = "default_tail_poll_interval")]
    pub poll_interval_sec: f64,
}

fn default_tail_max_items() -> usize {
    100
}

fn default_tail_poll_interval() -> f64 {
    0.1
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_items: default_tail_max_items(),
            poll_interval_sec: default_tail_poll_interval(),
        }
    }
}

/// Media adapter input options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaConfig {
    /// Media source path handed to the adapter.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Per-module toggles handed to the media adapter.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModulesConfig {
    /// Enable the vision module.
    #[serde(default)]
    pub enable_vision: bool,
    /// Enable the audio module.
    #[serde(default)]
    pub enable_audio: bool,
    /// Enable the thermal module.
    #[serde(default)]
    pub enable_thermal: bool,
    /// Enable the gait module.
    #[serde(default)]
    pub enable_gait: bool,
    /// Enable the scene-fusion module.
    #[serde(default)]
    pub enable_scene: bool,
}

/// Stateless governance policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GovernanceConfig {
    /// Events in these domains are dropped before decision.
    #[serde(default)]
    pub block_domains: Vec<String>,

    /// Events in these categories are dropped before decision.
    #[serde(default)]
    pub block_categories: Vec<String>,

    /// Per-domain severity ceilings (severity may only be lowered).
    #[serde(default)]
    pub severity_caps: BTreeMap<String, String>,

    /// Tasks with these actions are dropped before export.
    #[serde(default)]
    pub forbid_actions: Vec<String>,
}

/// Human-in-the-loop approval policy.
#[derive(Debug, Clone, Deserialize)]
pub struct HumanLoopConfig {
    /// Whether every task requires approval by default.
    #[serde(default)]
    pub default_require_approval: bool,

    /// Domains whose tasks always require approval.
    #[serde(default)]
    pub domain_require_approval: Vec<String>,

    /// Approve when policy is satisfied even with zero valid approvers.
    #[serde(default)]
    pub auto_approve: bool,

    /// Allow unsigned auto-approval when no roles or minimums apply.
    #[serde(default)]
    pub allow_unsigned_auto_approve: bool,

    /// Name recorded as `approved_by` for unsigned auto-approvals.
    #[serde(default = "default_approver_name")]
    pub approver: String,
}

fn default_approver_name() -> String {
    "auto_approver".to_string()
}

impl Default for HumanLoopConfig {
    fn default() -> Self {
        Self {
            default_require_approval: false,
            domain_require_approval: Vec::new(),
            auto_approve: false,
            allow_unsigned_auto_approve: false,
            approver: default_approver_name(),
        }
    }
}

/// A registered approver with a shared secret and roles.
#[derive(Debug, Clone, Deserialize)]
pub struct ApproverConfig {
    /// Approver id.
    pub id: String,

    /// Shared HMAC secret; never logged or serialized.
    pub secret: SecretString,

    /// Roles this approver carries.
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A presented approval token for this run.
#[derive(Debug, Clone, Deserialize)]
pub struct ActiveApprover {
    /// Approver id the token claims.
    pub id: String,

    /// base64url (no pad) HMAC-SHA256 token.
    pub token: String,
}

/// Role and minimum-approval requirements for one action.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionRequirement {
    /// Roles required to approve the action.
    #[serde(default)]
    pub required_roles: Vec<String>,

    /// Minimum number of valid approvers.
    #[serde(default)]
    pub min_approvals: u32,
}

/// Approver registry and signed-token policy.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RbacConfig {
    /// Registered approvers.
    #[serde(default)]
    pub approvers: Vec<ApproverConfig>,

    /// Tokens presented for this run.
    #[serde(default)]
    pub active_approvers: Vec<ActiveApprover>,

    /// Global minimum number of valid approvers.
    #[serde(default)]
    pub min_approvals: u32,

    /// Per-domain required roles.
    #[serde(default)]
    pub required_roles: BTreeMap<String, Vec<String>>,

    /// Per-action requirements.
    #[serde(default)]
    pub action_requirements: BTreeMap<String, ActionRequirement>,
}

impl RbacConfig {
    /// Looks up a registered approver by id.
    #[must_use]
    pub fn approver(&self, id: &str) -> Option<&ApproverConfig> {
        self.approvers.iter().find(|a| a.id == id)
    }
}

/// Rate limits applied to approved tasks.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimitsConfig {
    /// Maximum approved tasks per event.
    #[serde(default)]
    pub per_event: Option<usize>,

    /// Maximum approved tasks per assignee domain.
    #[serde(default)]
    pub per_domain: BTreeMap<String, usize>,

    /// Maximum approved tasks overall.
    #[serde(default)]
    pub total: Option<usize>,

    /// Maximum infrastructure tasks per exact asset id.
    #[serde(default)]
    pub per_asset_infra: BTreeMap<String, usize>,

    /// Glob-style (`*`) asset-id patterns with their caps.
    #[serde(default)]
    pub per_asset_infra_patterns: Vec<AssetPattern>,
}

/// One glob-style asset cap.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetPattern {
    /// Pattern matched against `asset_id`; `*` matches any run of
    /// characters.
    pub pattern: String,

    /// Cap for assets matching the pattern.
    pub n: usize,
}

/// A per-tenant risk budget.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskBudget {
    /// Maximum critical tasks inside the window.
    pub max: i64,

    /// Rolling window length in seconds.
    pub window_sec: i64,
}

/// Guardrail and risk-budget configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailsConfig {
    /// Rate limits applied to approved tasks.
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,

    /// Per-tenant risk budgets.
    #[serde(default)]
    pub risk_budgets: BTreeMap<String, RiskBudget>,

    /// Base backoff for risk holds, in seconds.
    #[serde(default = "default_risk_backoff_base")]
    pub risk_backoff_base_sec: i64,

    /// Risk store location; defaults to `<out>/risk_store.sqlite3`.
    #[serde(default)]
    pub risk_store_path: Option<PathBuf>,

    /// Emit a health alert when dropped/initial exceeds this ratio.
    #[serde(default = "default_health_alert_drop_ratio")]
    pub health_alert_drop_ratio: f64,
}

fn default_risk_backoff_base() -> i64 {
    60
}

fn default_health_alert_drop_ratio() -> f64 {
    0.5
}

impl Default for GuardrailsConfig {
    fn default() -> Self {
        Self {
            rate_limits: RateLimitsConfig::default(),
            risk_budgets: BTreeMap::new(),
            risk_backoff_base_sec: default_risk_backoff_base(),
            risk_store_path: None,
            health_alert_drop_ratio: default_health_alert_drop_ratio(),
        }
    }
}

/// Match criteria for an infrastructure mapping.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfraMatch {
    /// Event category to match; absent matches any.
    #[serde(default)]
    pub category: Option<String>,

    /// Event domain to match; absent matches any.
    #[serde(default)]
    pub domain: Option<String>,
}

/// One infrastructure task template.
#[derive(Debug, Clone, Deserialize)]
pub struct InfraTaskTemplate {
    /// Action verb (lock/unlock/open/close/notify/...).
    pub action: String,

    /// Target asset id.
    pub asset_id: String,

    /// Asset class (door/gate/camera/...).
    pub infrastructure_type: String,

    /// Overrides the event-derived assignee domain.
    #[serde(default)]
    pub assignee_domain: Option<String>,

    /// Task-level required-role override.
    #[serde(default)]
    pub required_roles: Option<Vec<String>>,

    /// Task-level minimum-approvals override.
    #[serde(default)]
    pub min_approvals: Option<u32>,
}

/// An infrastructure mapping from events to derived tasks.
#[derive(Debug, Clone, Deserialize)]
pub struct InfraMapping {
    /// Which events this mapping applies to.
    #[serde(rename = "match", default)]
    pub criteria: InfraMatch,

    /// Tasks emitted per matching event.
    #[serde(default)]
    pub tasks: Vec<InfraTaskTemplate>,
}

/// Infrastructure task configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InfrastructureConfig {
    /// Event-to-task mappings.
    #[serde(default)]
    pub mappings: Vec<InfraMapping>,

    /// Per-action requirement defaults merged into every derived task.
    #[serde(default)]
    pub action_defaults: BTreeMap<String, ActionRequirement>,
}

/// A JSONL file sink with optional size-based rollover.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonlSinkConfig {
    /// Output path.
    pub path: PathBuf,

    /// Rotate when the file reaches this size in bytes.
    #[serde(default)]
    pub rotate_max_bytes: Option<u64>,
}

/// Backoff strategy between HTTP retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// Delay grows by `backoff_seconds` each attempt.
    #[default]
    Linear,
    /// Delay doubles each attempt starting at `backoff_seconds`.
    Exponential,
}

/// An HTTP POST target with retry and DLQ discipline.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpSinkConfig {
    /// Target URL.
    pub url: String,

    /// Per-attempt timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: f64,

    /// Retries after the first attempt (total attempts = retries + 1).
    #[serde(default = "default_http_retries")]
    pub retries: u32,

    /// Base backoff between attempts, in seconds.
    #[serde(default = "default_http_backoff")]
    pub backoff_seconds: f64,

    /// Backoff growth strategy.
    #[serde(default)]
    pub backoff: BackoffMode,

    /// Where failed payloads land after the last retry.
    #[serde(default)]
    pub dlq_path: Option<PathBuf>,
}

fn default_http_timeout() -> f64 {
    5.0
}

fn default_http_retries() -> u32 {
    2
}

fn default_http_backoff() -> f64 {
    1.0
}

/// An infrastructure JSONL sink with optional HTTP forwarding.
#[derive(Debug, Clone, Deserialize)]
pub struct InfraSinkConfig {
    /// Output path.
    pub path: PathBuf,

    /// Rotate when the file reaches this size in bytes.
    #[serde(default)]
    pub rotate_max_bytes: Option<u64>,

    /// Forward each batch to this HTTP target.
    #[serde(default)]
    pub http: Option<HttpSinkConfig>,
}

/// Export stage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Sink tokens to run, in order.
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,

    /// `task_jsonl` sink options.
    #[serde(default)]
    pub task_jsonl: Option<JsonlSinkConfig>,

    /// `infrastructure` sink options.
    #[serde(default)]
    pub infrastructure: Option<InfraSinkConfig>,

    /// `webhook` sink options.
    #[serde(default)]
    pub webhook: Option<HttpSinkConfig>,
}

fn default_formats() -> Vec<String> {
    vec!["json".to_string()]
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            formats: default_formats(),
            task_jsonl: None,
            infrastructure: None,
            webhook: None,
        }
    }
}

/// Audit log configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfig {
    /// Audit file location; defaults to `<out>/audit_log.jsonl`.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Actor recorded on every entry.
    #[serde(default)]
    pub actor: Option<String>,

    /// HMAC signing secret; entries carry `sig` when set.
    #[serde(default)]
    pub sign_secret: Option<SecretString>,

    /// Verify the existing chain before the run starts.
    #[serde(default)]
    pub verify_on_start: bool,

    /// Reject unsigned entries during verification.
    #[serde(default)]
    pub require_signing: bool,
}

impl Config {
    /// Loads a config file, optionally deep-merging a policy pack onto it.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable files, invalid YAML, unknown
    /// enum values, or duplicate ids.
    pub fn load(
        path: impl AsRef<Path>,
        policy_pack: Option<&Path>,
    ) -> Result<LoadedConfig, PipelineError> {
        let mut value = load_yaml_value(path.as_ref())?;
        if let Some(pack) = policy_pack {
            let overlay = load_yaml_value(pack)?;
            deep_merge(&mut value, overlay);
        }
        Self::from_value(value)
    }

    /// Parses a merged YAML document into a typed config.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the document does not match the schema or
    /// fails validation.
    pub fn from_value(value: YamlValue) -> Result<LoadedConfig, PipelineError> {
        let canonical_hash = hash_config_value(&value)?;
        let config: Self = serde_yaml::from_value(value)
            .map_err(|err| PipelineError::Config(format!("invalid config: {err}")))?;
        config.validate()?;
        Ok(LoadedConfig {
            config,
            canonical_hash,
        })
    }

    /// Structural validation beyond what serde enforces.
    fn validate(&self) -> Result<(), PipelineError> {
        for token in &self.pipeline.export.formats {
            if !KNOWN_SINKS.contains(&token.as_str()) {
                return Err(PipelineError::Config(format!(
                    "unknown export sink '{token}' in export.formats"
                )));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for approver in &self.pipeline.rbac.approvers {
            if !seen.insert(approver.id.as_str()) {
                return Err(PipelineError::Config(format!(
                    "duplicate approver id '{}' in rbac.approvers",
                    approver.id
                )));
            }
        }

        for (tenant, budget) in &self.pipeline.guardrails.risk_budgets {
            if budget.max < 0 || budget.window_sec <= 0 {
                return Err(PipelineError::Config(format!(
                    "invalid risk budget for tenant '{tenant}': max must be >= 0 and window_sec > 0"
                )));
            }
        }

        let ratio = self.pipeline.guardrails.health_alert_drop_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(PipelineError::Config(format!(
                "guardrails.health_alert_drop_ratio must be in [0, 1], got {ratio}"
            )));
        }

        Ok(())
    }
}

/// Reads and parses one YAML file.
fn load_yaml_value(path: &Path) -> Result<YamlValue, PipelineError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        PipelineError::Config(format!("cannot read config {}: {err}", path.display()))
    })?;
    serde_yaml::from_str(&raw).map_err(|err| {
        PipelineError::Config(format!("invalid YAML in {}: {err}", path.display()))
    })
}

/// Deep-merges `overlay` onto `base`: maps merge recursively, everything
/// else (scalars, lists) is replaced.
pub fn deep_merge(base: &mut YamlValue, overlay: YamlValue) {
    match (base, overlay) {
        (YamlValue::Mapping(base_map), YamlValue::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Appends an active approver (id + token) to the raw config document.
///
/// Used by the CLI `--approver-id`/`--approver-token` flags, which must
/// take effect before typed parsing.
pub fn inject_active_approver(value: &mut YamlValue, id: &str, token: &str) {
    use serde_yaml::Mapping;

    let root = ensure_mapping(value);
    let pipeline = ensure_mapping(
        root.entry(YamlValue::from("pipeline"))
            .or_insert_with(|| YamlValue::Mapping(Mapping::new())),
    );
    let rbac = ensure_mapping(
        pipeline
            .entry(YamlValue::from("rbac"))
            .or_insert_with(|| YamlValue::Mapping(Mapping::new())),
    );
    let actives = rbac
        .entry(YamlValue::from("active_approvers"))
        .or_insert_with(|| YamlValue::Sequence(Vec::new()));
    if let YamlValue::Sequence(seq) = actives {
        let mut entry = Mapping::new();
        entry.insert(YamlValue::from("id"), YamlValue::from(id));
        entry.insert(YamlValue::from("token"), YamlValue::from(token));
        seq.push(YamlValue::Mapping(entry));
    }
}

fn ensure_mapping(value: &mut YamlValue) -> &mut serde_yaml::Mapping {
    if !matches!(value, YamlValue::Mapping(_)) {
        *value = YamlValue::Mapping(serde_yaml::Mapping::new());
    }
    match value {
        YamlValue::Mapping(map) => map,
        _ => unreachable!("value was just set to a mapping"),
    }
}

/// Canonical hash of a YAML document, via its JSON representation.
fn hash_config_value(value: &YamlValue) -> Result<String, PipelineError> {
    let json = serde_json::to_value(value).map_err(|err| {
        PipelineError::Config(format!("config is not JSON-representable: {err}"))
    })?;
    Ok(canonical::hash_value(&json))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<LoadedConfig, PipelineError> {
        Config::from_value(serde_yaml::from_str(yaml).unwrap())
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let loaded = parse("{}").unwrap();
        let cfg = loaded.config;
        assert_eq!(cfg.pipeline.ingest.mode, IngestMode::Scenario);
        assert_eq!(cfg.pipeline.export.formats, vec!["json".to_string()]);
        assert!(!cfg.pipeline.human_loop.default_require_approval);
        assert_eq!(cfg.pipeline.guardrails.risk_backoff_base_sec, 60);
    }

    #[test]
    fn test_unknown_sink_rejected() {
        let err = parse("pipeline:\n  export:\n    formats: [json, carrier_pigeon]\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("carrier_pigeon"));
    }

    #[test]
    fn test_unknown_ingest_mode_rejected() {
        let err = parse("pipeline:\n  ingest:\n    mode: firehose\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_duplicate_approver_id_rejected() {
        let yaml = r"
pipeline:
  rbac:
    approvers:
      - {id: a, secret: k1}
      - {id: a, secret: k2}
";
        let err = parse(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate approver id"));
    }

    #[test]
    fn test_deep_merge_replaces_lists_and_merges_maps() {
        let mut base: YamlValue = serde_yaml::from_str(
            r"
pipeline:
  governance:
    block_domains: [air, sea]
    severity_caps:
      cyber: critical
",
        )
        .unwrap();
        let overlay: YamlValue = serde_yaml::from_str(
            r"
pipeline:
  governance:
    block_domains: [space]
    severity_caps:
      air: warning
",
        )
        .unwrap();
        deep_merge(&mut base, overlay);

        let loaded = Config::from_value(base).unwrap();
        let gov = loaded.config.pipeline.governance;
        // Leaf list replaced, not concatenated.
        assert_eq!(gov.block_domains, vec!["space".to_string()]);
        // Maps merged key-wise.
        assert_eq!(gov.severity_caps.get("cyber").unwrap(), "critical");
        assert_eq!(gov.severity_caps.get("air").unwrap(), "warning");
    }

    #[test]
    fn test_merge_changes_canonical_hash() {
        let base: YamlValue = serde_yaml::from_str("pipeline: {}").unwrap();
        let hash_before = Config::from_value(base.clone()).unwrap().canonical_hash;

        let mut merged = base;
        let overlay: YamlValue =
            serde_yaml::from_str("pipeline:\n  governance:\n    forbid_actions: [strike]").unwrap();
        deep_merge(&mut merged, overlay);
        let hash_after = Config::from_value(merged).unwrap().canonical_hash;
        assert_ne!(hash_before, hash_after);
    }

    #[test]
    fn test_inject_active_approver() {
        let mut value: YamlValue = serde_yaml::from_str("{}").unwrap();
        inject_active_approver(&mut value, "alice", "tok123");
        let loaded = Config::from_value(value).unwrap();
        let actives = loaded.config.pipeline.rbac.active_approvers;
        assert_eq!(actives.len(), 1);
        assert_eq!(actives[0].id, "alice");
        assert_eq!(actives[0].token, "tok123");
    }

    #[test]
    fn test_invalid_drop_ratio_rejected() {
        let err = parse("pipeline:\n  guardrails:\n    health_alert_drop_ratio: 1.5\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
