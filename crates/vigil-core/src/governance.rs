//! Stateless governance policy, applied at two points in a run.
//!
//! After rules (pre-decision): events in blocked domains or categories are
//! dropped, and per-domain severity caps lower severities that exceed them.
//! Severity is never raised. Before export (post-decision): tasks whose
//! action is forbidden are dropped, one `governance_forbid` audit entry per
//! drop.

use serde_json::json;

use crate::audit::AuditLog;
use crate::config::GovernanceConfig;
use crate::error::PipelineError;
use crate::types::{Event, Severity, TaskRecommendation};

/// Outcome of the pre-decision event filter.
#[derive(Debug)]
pub struct EventFilterOutcome {
    /// Surviving events, in rule-emission order.
    pub events: Vec<Event>,

    /// Events dropped by domain or category blocks.
    pub dropped: usize,

    /// Events whose severity was lowered by a cap.
    pub capped: usize,
}

/// Applies domain/category blocks and severity caps to events.
///
/// Audits `governance_filtered` with drop and cap counts.
///
/// # Errors
///
/// Only fails if the audit append fails.
pub fn filter_events(
    cfg: &GovernanceConfig,
    events: Vec<Event>,
    audit: &AuditLog,
) -> Result<EventFilterOutcome, PipelineError> {
    let before = events.len();
    let mut capped = 0usize;

    let mut kept: Vec<Event> = Vec::with_capacity(before);
    for mut event in events {
        if cfg.block_domains.contains(&event.domain)
            || cfg.block_categories.contains(&event.category)
        {
            continue;
        }
        if let Some(cap) = cfg.severity_caps.get(&event.domain) {
            let cap = Severity::parse_lenient(cap);
            if cap < event.severity {
                tracing::debug!(
                    event_id = %event.id,
                    from = %event.severity,
                    to = %cap,
                    "severity capped"
                );
                event.severity = cap;
                capped += 1;
            }
        }
        kept.push(event);
    }

    let dropped = before - kept.len();
    audit.append(
        "governance_filtered",
        json!({"dropped": dropped, "capped": capped}),
    )?;
    Ok(EventFilterOutcome {
        events: kept,
        dropped,
        capped,
    })
}

/// Drops tasks with forbidden actions, auditing each drop.
///
/// # Errors
///
/// Only fails if an audit append fails.
pub fn filter_tasks(
    cfg: &GovernanceConfig,
    tasks: Vec<TaskRecommendation>,
    audit: &AuditLog,
) -> Result<Vec<TaskRecommendation>, PipelineError> {
    let mut kept = Vec::with_capacity(tasks.len());
    for task in tasks {
        if cfg.forbid_actions.contains(&task.action) {
            audit.append(
                "governance_forbid",
                json!({"task_id": task.id, "action": task.action}),
            )?;
            continue;
        }
        kept.push(task);
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::types::{TaskStatus, TimeWindow};

    fn event(id: &str, domain: &str, category: &str, severity: Severity) -> Event {
        Event {
            id: id.to_string(),
            category: category.to_string(),
            severity,
            status: "open".to_string(),
            domain: domain.to_string(),
            summary: "test".to_string(),
            time_window: TimeWindow {
                start_ms: 0,
                end_ms: 0,
            },
            entities: vec![],
            sources: vec![],
            tags: vec![],
            evidence: vec![],
            tenant: None,
        }
    }

    fn task(id: &str, action: &str) -> TaskRecommendation {
        TaskRecommendation {
            id: id.to_string(),
            event_id: "ev".to_string(),
            action: action.to_string(),
            assignee_domain: "land".to_string(),
            priority: 3,
            rationale: String::new(),
            confidence: 0.5,
            infrastructure_type: None,
            asset_id: None,
            requires_approval: false,
            status: TaskStatus::Approved,
            approved_by: None,
            tenant: "default".to_string(),
            hold_reason: None,
            hold_until_epoch: None,
        }
    }

    fn test_audit() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let audit =
            AuditLog::open(dir.path().join("audit_log.jsonl"), &AuditConfig::default()).unwrap();
        (dir, audit)
    }

    #[test]
    fn test_blocked_domain_dropped() {
        let (_dir, audit) = test_audit();
        let cfg = GovernanceConfig {
            block_domains: vec!["space".to_string()],
            ..GovernanceConfig::default()
        };
        let events = vec![
            event("e1", "space", "status", Severity::Info),
            event("e2", "air", "status", Severity::Info),
        ];
        let out = filter_events(&cfg, events, &audit).unwrap();
        assert_eq!(out.dropped, 1);
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].id, "e2");
    }

    #[test]
    fn test_blocked_category_dropped() {
        let (_dir, audit) = test_audit();
        let cfg = GovernanceConfig {
            block_categories: vec!["gossip".to_string()],
            ..GovernanceConfig::default()
        };
        let events = vec![event("e1", "cyber", "gossip", Severity::Critical)];
        let out = filter_events(&cfg, events, &audit).unwrap();
        assert!(out.events.is_empty());
    }

    #[test]
    fn test_cap_lowers_but_never_raises() {
        let (_dir, audit) = test_audit();
        let mut caps = std::collections::BTreeMap::new();
        caps.insert("cyber".to_string(), "warning".to_string());
        let cfg = GovernanceConfig {
            severity_caps: caps,
            ..GovernanceConfig::default()
        };
        let events = vec![
            event("e1", "cyber", "intrusion", Severity::Critical),
            event("e2", "cyber", "intrusion", Severity::Info),
        ];
        let out = filter_events(&cfg, events, &audit).unwrap();
        assert_eq!(out.events[0].severity, Severity::Warning);
        // An event below the cap is untouched.
        assert_eq!(out.events[1].severity, Severity::Info);
        assert_eq!(out.capped, 1);
    }

    #[test]
    fn test_forbidden_action_dropped_and_audited() {
        let (dir, audit) = test_audit();
        let cfg = GovernanceConfig {
            forbid_actions: vec!["strike".to_string()],
            ..GovernanceConfig::default()
        };
        let tasks = vec![task("t1", "strike"), task("t2", "investigate")];
        let kept = filter_tasks(&cfg, tasks, &audit).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "t2");

        let log = std::fs::read_to_string(dir.path().join("audit_log.jsonl")).unwrap();
        assert!(log.contains("governance_forbid"));
        assert!(log.contains(r#""task_id":"t1""#));
    }
}
