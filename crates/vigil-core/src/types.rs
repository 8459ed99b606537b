//! Core data model shared by every pipeline stage.
//!
//! All entities are plain serde structs; the orchestrator owns the per-run
//! collections and passes them between stages as materialized `Vec`s. Sensor
//! `details` are deliberately untyped (`serde_json::Map`): rule conditions
//! perform typed reads with defaulted coercions, and invalid types evaluate
//! false rather than erroring.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A geographic position attached to a reading.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geo {
    /// Latitude in decimal degrees.
    pub lat: f64,
    /// Longitude in decimal degrees.
    pub lon: f64,
}

/// One heterogeneous observation produced by the ingest stage.
///
/// Immutable after creation. `id` must be unique within a run; `ts_ms` is
/// not required to be monotonic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorReading {
    /// Unique reading id within the run.
    pub id: String,

    /// Identifier of the producing sensor.
    pub sensor_id: String,

    /// Domain label (`air`, `cyber`, `facility`, ...); no fixed enum.
    pub domain: String,

    /// Sensor modality (`netflow`, `radar`, `camera`, ...).
    pub source_type: String,

    /// Observation timestamp in milliseconds since the Unix epoch.
    pub ts_ms: i64,

    /// Optional geographic position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo: Option<Geo>,

    /// Free-form observation payload.
    #[serde(default)]
    pub details: Map<String, Value>,
}

impl SensorReading {
    /// Reads a string-valued detail, if present and actually a string.
    #[must_use]
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details.get(key).and_then(Value::as_str)
    }
}

/// A fused summary of readings that share a track key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityTrack {
    /// Track key: `details.track_id` or `anon_<domain>_<sensor_id>`.
    pub id: String,

    /// Domain of the contributing readings.
    pub domain: String,

    /// Human-readable label.
    pub label: String,

    /// Accumulated attributes (currently sparse).
    #[serde(default)]
    pub attributes: Map<String, Value>,

    /// Maximum `ts_ms` over contributing readings.
    pub last_seen_ms: i64,
}

/// Event severity, ordered from least to most severe.
///
/// Unknown severity strings parse as [`Severity::Info`] and therefore the
/// lowest rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Routine, informational.
    #[default]
    Info,
    /// Worth noting.
    Notice,
    /// Degraded or suspicious.
    Warning,
    /// Requires a response.
    Critical,
}

impl Severity {
    /// Numeric rank: info=1, notice=2, warning=3, critical=4.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::Info => 1,
            Self::Notice => 2,
            Self::Warning => 3,
            Self::Critical => 4,
        }
    }

    /// Parses a severity string, mapping unknown values to `Info`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s {
            "notice" => Self::Notice,
            "warning" => Self::Warning,
            "critical" => Self::Critical,
            _ => Self::Info,
        }
    }

    /// Lowercase string form, matching the serialized representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Notice => "notice",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The inclusive time window an event covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    /// Window start in milliseconds since the Unix epoch.
    pub start_ms: i64,
    /// Window end in milliseconds since the Unix epoch.
    pub end_ms: i64,
}

/// One evidence record linking an event back to its source reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    /// Evidence kind; currently always `sensor_reading`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Id of the source reading.
    pub id: String,

    /// Sensor that produced the source reading.
    pub source: String,

    /// SHA-256 hex over the canonical serialization of the reading details.
    pub hash: String,

    /// The observed details, carried verbatim.
    pub observables: Map<String, Value>,
}

/// A system-recognized occurrence derived from readings by rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// `ev_<reading_id>_<rule_id>`; unique within a run.
    pub id: String,

    /// Event category from the rule template.
    pub category: String,

    /// Severity; may be lowered by governance caps, never raised.
    pub severity: Severity,

    /// Lifecycle status; events start `open`.
    pub status: String,

    /// Domain of the source reading, or `multi`.
    pub domain: String,

    /// Human-readable summary from the rule template.
    pub summary: String,

    /// Time window covered by the event.
    pub time_window: TimeWindow,

    /// Entity (track) ids involved.
    #[serde(default)]
    pub entities: Vec<String>,

    /// Source sensor ids.
    #[serde(default)]
    pub sources: Vec<String>,

    /// Tags; always carries the emitting rule id.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Evidence records with content hashes.
    #[serde(default)]
    pub evidence: Vec<Evidence>,

    /// Tenant owning this event, when the source reading carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

/// Lifecycle status of a task recommendation.
///
/// Legal transitions within a run: initial → `Approved` or
/// `PendingApproval`; `Approved` → `RiskHold`. A task never returns to
/// `Approved` within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Cleared for the plan and export.
    Approved,
    /// Awaiting human approval; withheld from plan and guardrail counts.
    PendingApproval,
    /// Rolled back by a risk budget; terminal within the run.
    RiskHold,
}

impl TaskStatus {
    /// Lowercase string form, matching the serialized representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::PendingApproval => "pending_approval",
            Self::RiskHold => "risk_hold",
        }
    }
}

/// A recommended action associated with an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecommendation {
    /// Task id, derived from the event id.
    pub id: String,

    /// The event this task responds to.
    pub event_id: String,

    /// Action verb (`investigate`, `lock`, `notify`, ...).
    pub action: String,

    /// Domain expected to execute the action.
    pub assignee_domain: String,

    /// Priority in 1..=5, 1 highest: `max(1, 5 - severity_rank)`.
    pub priority: u8,

    /// Human-readable justification.
    pub rationale: String,

    /// Confidence in [0, 1].
    pub confidence: f64,

    /// Infrastructure asset class, for derived infrastructure tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_type: Option<String>,

    /// Target asset id, for derived infrastructure tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_id: Option<String>,

    /// Whether approval policy applies to this task.
    pub requires_approval: bool,

    /// Current lifecycle status.
    pub status: TaskStatus,

    /// Comma-joined ids of the approvers that unlocked this task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,

    /// Tenant used to scope risk budgets.
    pub tenant: String,

    /// Why the task is held, when `status` is `risk_hold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_reason: Option<String>,

    /// Epoch seconds until which the hold applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold_until_epoch: Option<i64>,
}

impl TaskRecommendation {
    /// Whether this is a derived infrastructure task.
    #[must_use]
    pub const fn is_infrastructure(&self) -> bool {
        self.infrastructure_type.is_some()
    }
}
