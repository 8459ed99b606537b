//! Declarative rule evaluation over sensor readings.
//!
//! A rule has a `when` match predicate and a `then` event template. Rules
//! stay declarative: there is no code execution, and unknown condition names
//! are rejected at load time. Typed reads from the free-form `details` map
//! use defaulted coercions; a value of the wrong type makes the condition
//! evaluate false rather than erroring.
//!
//! Ordering is deterministic: rules are evaluated in declaration order and
//! events are emitted in (reading order, rule order). A duplicate emitted
//! event id means a rule misconfiguration and fails the run loudly.

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::canonical;
use crate::error::PipelineError;
use crate::types::{Event, Evidence, SensorReading, Severity, TimeWindow};

/// One compiled rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Rule id; unique within the rule set.
    pub id: String,
    /// Domain equality filter.
    pub domain: Option<String>,
    /// Source-type equality filter.
    pub source_type: Option<String>,
    /// Optional detail condition.
    pub condition: Option<RuleCondition>,
    /// Event template.
    pub then: RuleThen,
}

/// The detail condition of a rule's `when` clause.
#[derive(Debug, Clone)]
pub enum RuleCondition {
    /// `details.altitude_ft < threshold`.
    AltitudeBelow(f64),
    /// `details.night_motion == true`.
    NightMotion,
    /// `details.scan_count >= threshold`.
    PortScan(i64),
    /// Case-insensitive substring of `details.text`.
    Keyword(String),
    /// Every key/value pair must match the reading's details.
    DetailsEquals(Map<String, Value>),
}

/// The event template of a rule's `then` clause.
#[derive(Debug, Clone)]
pub struct RuleThen {
    /// Event category.
    pub category: String,
    /// Event severity.
    pub severity: Severity,
    /// Event summary.
    pub summary: String,
}

/// An ordered, validated set of rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize)]
struct RuleSpec {
    id: String,
    #[serde(default)]
    when: WhenSpec,
    #[serde(default)]
    then: ThenSpec,
}

#[derive(Debug, Default, Deserialize)]
struct WhenSpec {
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    source_type: Option<String>,
    #[serde(default)]
    condition: Option<String>,
    #[serde(default)]
    threshold: Option<Value>,
    #[serde(default)]
    equals: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct ThenSpec {
    #[serde(default = "default_category")]
    category: String,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default = "default_summary")]
    summary: String,
}

fn default_category() -> String {
    "status".to_string()
}

fn default_summary() -> String {
    "rule_triggered".to_string()
}

impl Default for ThenSpec {
    fn default() -> Self {
        Self {
            category: default_category(),
            severity: None,
            summary: default_summary(),
        }
    }
}

impl RuleSet {
    /// Loads and compiles a YAML rule file.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for unreadable files, invalid YAML, duplicate
    /// rule ids, or unknown condition names.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PipelineError::Config(format!("cannot read rules {}: {err}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    /// Compiles a YAML rules document.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RuleSet::load`].
    pub fn from_yaml(raw: &str) -> Result<Self, PipelineError> {
        let file: RulesFile = serde_yaml::from_str(raw)
            .map_err(|err| PipelineError::Config(format!("invalid rules file: {err}")))?;

        let mut rules = Vec::with_capacity(file.rules.len());
        let mut seen = HashSet::new();
        for spec in file.rules {
            if !seen.insert(spec.id.clone()) {
                return Err(PipelineError::Config(format!(
                    "duplicate rule id '{}'",
                    spec.id
                )));
            }
            rules.push(compile_rule(spec)?);
        }
        Ok(Self { rules })
    }

    /// Number of rules in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluates all rules over all readings, in order.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when two emissions collide on an event id.
    pub fn evaluate(&self, readings: &[SensorReading]) -> Result<Vec<Event>, PipelineError> {
        let mut events = Vec::new();
        let mut seen_ids = HashSet::new();

        for reading in readings {
            for rule in &self.rules {
                if !rule.matches(reading) {
                    continue;
                }
                let event = rule.make_event(reading);
                if !seen_ids.insert(event.id.clone()) {
                    return Err(PipelineError::Config(format!(
                        "duplicate event id '{}' (rule '{}'): reading ids must be unique per run",
                        event.id, rule.id
                    )));
                }
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl Rule {
    /// Whether this rule matches a reading.
    #[must_use]
    pub fn matches(&self, reading: &SensorReading) -> bool {
        if let Some(domain) = &self.domain {
            if domain != &reading.domain {
                return false;
            }
        }
        if let Some(source_type) = &self.source_type {
            if source_type != &reading.source_type {
                return false;
            }
        }
        match &self.condition {
            None => true,
            Some(cond) => cond.matches(&reading.details),
        }
    }

    fn make_event(&self, reading: &SensorReading) -> Event {
        let track_id = reading
            .detail_str("track_id")
            .unwrap_or("unknown")
            .to_string();
        let evidence = Evidence {
            kind: "sensor_reading".to_string(),
            id: reading.id.clone(),
            source: reading.sensor_id.clone(),
            hash: canonical::hash_details(&reading.details),
            observables: reading.details.clone(),
        };

        Event {
            id: format!("ev_{}_{}", reading.id, self.id),
            category: self.then.category.clone(),
            severity: self.then.severity,
            status: "open".to_string(),
            domain: reading.domain.clone(),
            summary: self.then.summary.clone(),
            time_window: TimeWindow {
                start_ms: reading.ts_ms,
                end_ms: reading.ts_ms,
            },
            entities: vec![track_id],
            sources: vec![reading.sensor_id.clone()],
            tags: vec![self.id.clone()],
            evidence: vec![evidence],
            tenant: reading.detail_str("tenant").map(String::from),
        }
    }
}

impl RuleCondition {
    /// Evaluates the condition against a details map.
    #[must_use]
    pub fn matches(&self, details: &Map<String, Value>) -> bool {
        match self {
            Self::AltitudeBelow(threshold) => match details.get("altitude_ft") {
                // Missing altitude reads as 0, matching any positive threshold.
                None => 0.0 < *threshold,
                // Present but non-numeric evaluates false.
                Some(value) => value.as_f64().is_some_and(|alt| alt < *threshold),
            },
            Self::NightMotion => details
                .get("night_motion")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            Self::PortScan(threshold) => details
                .get("scan_count")
                .and_then(Value::as_i64)
                .unwrap_or(0)
                .ge(threshold),
            Self::Keyword(needle) => details
                .get("text")
                .and_then(Value::as_str)
                .is_some_and(|text| text.to_lowercase().contains(&needle.to_lowercase())),
            Self::DetailsEquals(expected) => expected
                .iter()
                .all(|(key, value)| details.get(key) == Some(value)),
        }
    }
}

fn compile_rule(spec: RuleSpec) -> Result<Rule, PipelineError> {
    let condition = match spec.when.condition.as_deref() {
        None => None,
        Some("altitude_below") => Some(RuleCondition::AltitudeBelow(numeric_threshold(
            &spec.id,
            spec.when.threshold.as_ref(),
        )?)),
        Some("night_motion") => Some(RuleCondition::NightMotion),
        Some("port_scan") => {
            let threshold = spec
                .when
                .threshold
                .as_ref()
                .and_then(Value::as_i64)
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "rule '{}': port_scan condition requires an integer threshold",
                        spec.id
                    ))
                })?;
            Some(RuleCondition::PortScan(threshold))
        }
        Some("keyword") => {
            let needle = spec
                .when
                .threshold
                .as_ref()
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    PipelineError::Config(format!(
                        "rule '{}': keyword condition requires a string threshold",
                        spec.id
                    ))
                })?;
            Some(RuleCondition::Keyword(needle.to_string()))
        }
        Some("details_equals") => {
            let expected = spec.when.equals.clone().ok_or_else(|| {
                PipelineError::Config(format!(
                    "rule '{}': details_equals condition requires an 'equals' map",
                    spec.id
                ))
            })?;
            Some(RuleCondition::DetailsEquals(expected))
        }
        Some(other) => {
            return Err(PipelineError::Config(format!(
                "rule '{}': unknown condition '{other}'",
                spec.id
            )));
        }
    };

    Ok(Rule {
        id: spec.id,
        domain: spec.when.domain,
        source_type: spec.when.source_type,
        condition,
        then: RuleThen {
            category: spec.then.category,
            severity: spec
                .then
                .severity
                .as_deref()
                .map_or(Severity::Info, Severity::parse_lenient),
            summary: spec.then.summary,
        },
    })
}

fn numeric_threshold(rule_id: &str, threshold: Option<&Value>) -> Result<f64, PipelineError> {
    threshold.and_then(Value::as_f64).ok_or_else(|| {
        PipelineError::Config(format!(
            "rule '{rule_id}': condition requires a numeric threshold"
        ))
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn reading(id: &str, domain: &str, source_type: &str, details: Value) -> SensorReading {
        SensorReading {
            id: id.to_string(),
            sensor_id: "s1".to_string(),
            domain: domain.to_string(),
            source_type: source_type.to_string(),
            ts_ms: 1000,
            geo: None,
            details: details.as_object().cloned().unwrap_or_default(),
        }
    }

    const PORT_SCAN_RULES: &str = r"
rules:
  - id: port_scan
    when: {domain: cyber, source_type: netflow, condition: port_scan, threshold: 20}
    then: {category: intrusion, severity: critical, summary: port scan detected}
";

    #[test]
    fn test_port_scan_threshold() {
        let rules = RuleSet::from_yaml(PORT_SCAN_RULES).unwrap();
        let hit = reading("r1", "cyber", "netflow", json!({"scan_count": 25, "track_id": "t"}));
        let miss = reading("r2", "cyber", "netflow", json!({"scan_count": 19}));

        let events = rules.evaluate(&[hit, miss]).unwrap();
        assert_eq!(events.len(), 1);
        let ev = &events[0];
        assert_eq!(ev.id, "ev_r1_port_scan");
        assert_eq!(ev.severity, Severity::Critical);
        assert_eq!(ev.category, "intrusion");
        assert_eq!(ev.entities, vec!["t".to_string()]);
        assert_eq!(ev.tags, vec!["port_scan".to_string()]);
        assert_eq!(ev.status, "open");
    }

    #[test]
    fn test_domain_filter_excludes_other_domains() {
        let rules = RuleSet::from_yaml(PORT_SCAN_RULES).unwrap();
        let other = reading("r1", "air", "netflow", json!({"scan_count": 99}));
        assert!(rules.evaluate(&[other]).unwrap().is_empty());
    }

    #[test]
    fn test_altitude_below() {
        let yaml = r"
rules:
  - id: low_flight
    when: {domain: air, condition: altitude_below, threshold: 400}
    then: {category: airspace, severity: warning}
";
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let low = reading("r1", "air", "radar", json!({"altitude_ft": 350.5}));
        let high = reading("r2", "air", "radar", json!({"altitude_ft": 1200}));
        // Missing altitude coerces to 0, which is below the threshold.
        let missing = reading("r3", "air", "radar", json!({}));
        // Wrong type evaluates false, not an error.
        let wrong = reading("r4", "air", "radar", json!({"altitude_ft": "low"}));

        let events = rules.evaluate(&[low, high, missing, wrong]).unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["ev_r1_low_flight", "ev_r3_low_flight"]);
    }

    #[test]
    fn test_night_motion_flag() {
        let yaml = r"
rules:
  - id: nm
    when: {condition: night_motion}
    then: {severity: notice}
";
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let on = reading("r1", "facility", "camera", json!({"night_motion": true}));
        let off = reading("r2", "facility", "camera", json!({"night_motion": false}));
        // Wrong type evaluates false, not an error.
        let wrong = reading("r3", "facility", "camera", json!({"night_motion": "yes"}));

        let events = rules.evaluate(&[on, off, wrong]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "ev_r1_nm");
    }

    #[test]
    fn test_keyword_is_case_insensitive() {
        let yaml = r"
rules:
  - id: kw
    when: {condition: keyword, threshold: Breach}
    then: {severity: warning}
";
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let hit = reading("r1", "cyber", "log", json!({"text": "perimeter BREACH detected"}));
        let miss = reading("r2", "cyber", "log", json!({"text": "all clear"}));

        let events = rules.evaluate(&[hit, miss]).unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_details_equals_requires_every_pair() {
        let yaml = r"
rules:
  - id: badge
    when:
      condition: details_equals
      equals: {badge: denied, door: north}
    then: {category: access, severity: notice}
";
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let full = reading("r1", "facility", "badge", json!({"badge": "denied", "door": "north"}));
        let partial = reading("r2", "facility", "badge", json!({"badge": "denied"}));

        let events = rules.evaluate(&[full, partial]).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "ev_r1_badge");
    }

    #[test]
    fn test_unknown_condition_is_config_error() {
        let yaml = r"
rules:
  - id: bad
    when: {condition: sentiment_negative}
    then: {}
";
        let err = RuleSet::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("sentiment_negative"));
    }

    #[test]
    fn test_duplicate_rule_id_is_config_error() {
        let yaml = r"
rules:
  - id: twice
    when: {condition: night_motion}
    then: {}
  - id: twice
    when: {condition: night_motion}
    then: {}
";
        let err = RuleSet::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("duplicate rule id"));
    }

    #[test]
    fn test_duplicate_reading_id_fails_at_evaluation() {
        let rules = RuleSet::from_yaml(PORT_SCAN_RULES).unwrap();
        let a = reading("r1", "cyber", "netflow", json!({"scan_count": 30}));
        let b = reading("r1", "cyber", "netflow", json!({"scan_count": 40}));
        let err = rules.evaluate(&[a, b]).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
        assert!(err.to_string().contains("ev_r1_port_scan"));
    }

    #[test]
    fn test_unknown_severity_defaults_to_info() {
        let yaml = r"
rules:
  - id: odd
    when: {condition: night_motion}
    then: {severity: apocalyptic}
";
        let rules = RuleSet::from_yaml(yaml).unwrap();
        let r = reading("r1", "facility", "camera", json!({"night_motion": true}));
        let events = rules.evaluate(&[r]).unwrap();
        assert_eq!(events[0].severity, Severity::Info);
    }

    #[test]
    fn test_evidence_carries_content_hash() {
        let rules = RuleSet::from_yaml(PORT_SCAN_RULES).unwrap();
        let r = reading("r1", "cyber", "netflow", json!({"scan_count": 25}));
        let expected_hash = canonical::hash_details(&r.details);

        let events = rules.evaluate(&[r]).unwrap();
        let evidence = &events[0].evidence[0];
        assert_eq!(evidence.kind, "sensor_reading");
        assert_eq!(evidence.hash, expected_hash);
        assert_eq!(evidence.source, "s1");
    }

    #[test]
    fn test_tenant_propagates_from_details() {
        let rules = RuleSet::from_yaml(PORT_SCAN_RULES).unwrap();
        let r = reading("r1", "cyber", "netflow", json!({"scan_count": 25, "tenant": "acme"}));
        let events = rules.evaluate(&[r]).unwrap();
        assert_eq!(events[0].tenant.as_deref(), Some("acme"));
    }
}
