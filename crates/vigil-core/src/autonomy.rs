//! Autonomy: clusters approved tasks into a per-domain plan.
//!
//! Within each domain, entries are ordered by priority ascending (1 first)
//! and then by task id, so plan output is deterministic.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::json;

use crate::audit::AuditLog;
use crate::error::PipelineError;
use crate::types::TaskRecommendation;

/// One plan entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlanEntry {
    /// Task id.
    pub id: String,
    /// Event the task responds to.
    pub event_id: String,
    /// Task priority.
    pub priority: u8,
}

/// The per-domain plan.
pub type Plan = BTreeMap<String, Vec<PlanEntry>>;

/// Clusters approved tasks into a plan, audited as `autonomy_plan`.
///
/// # Errors
///
/// Only fails if the audit append fails.
pub fn plan(tasks: &[TaskRecommendation], audit: &AuditLog) -> Result<Plan, PipelineError> {
    let mut by_domain: Plan = BTreeMap::new();
    for task in tasks {
        by_domain
            .entry(task.assignee_domain.clone())
            .or_default()
            .push(PlanEntry {
                id: task.id.clone(),
                event_id: task.event_id.clone(),
                priority: task.priority,
            });
    }

    for entries in by_domain.values_mut() {
        entries.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
    }

    let domains: Vec<&String> = by_domain.keys().collect();
    audit.append("autonomy_plan", json!({"domains": domains}))?;
    Ok(by_domain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditConfig;
    use crate::types::TaskStatus;

    fn task(id: &str, domain: &str, priority: u8) -> TaskRecommendation {
        TaskRecommendation {
            id: id.to_string(),
            event_id: format!("ev_{id}"),
            action: "investigate".to_string(),
            assignee_domain: domain.to_string(),
            priority,
            rationale: String::new(),
            confidence: 0.7,
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

    #[test]
    fn test_plan_groups_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let audit =
            AuditLog::open(dir.path().join("audit_log.jsonl"), &AuditConfig::default()).unwrap();

        let tasks = vec![
            task("t_b", "air", 3),
            task("t_a", "air", 1),
            task("t_c", "air", 1),
            task("t_d", "cyber", 2),
        ];
        let plan = plan(&tasks, &audit).unwrap();

        assert_eq!(plan.len(), 2);
        let air: Vec<&str> = plan["air"].iter().map(|e| e.id.as_str()).collect();
        // Priority ascending, then id.
        assert_eq!(air, vec!["t_a", "t_c", "t_b"]);
        assert_eq!(plan["cyber"].len(), 1);

        let log = std::fs::read_to_string(dir.path().join("audit_log.jsonl")).unwrap();
        assert!(log.contains("autonomy_plan"));
        assert!(log.contains(r#""domains":["air","cyber"]"#));
    }
}
