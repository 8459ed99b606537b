//! Decision: turns open events into task recommendations and evaluates
//! their approval state.
//!
//! Every open event yields a base `investigate` task; infrastructure
//! mappings may derive additional tasks (lock/unlock/open/close/notify/...)
//! with per-task role and minimum-approval overrides.
//!
//! # Approval evaluation
//!
//! The signing message for a task is the ASCII string
//! `"<event_id>:<assignee_domain>:<action>:<tenant>"`. Each configured
//! active approver presents `base64url_nopad(HMAC-SHA256(secret, message))`;
//! tokens are checked with a constant-time comparison. A task auto-approves
//! iff the valid approvers meet the role union and minimum count, and either
//! `auto_approve` is set or at least one valid approver is present. Unsigned
//! auto-approval applies only when no approval demands exist at all.

use std::collections::BTreeSet;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::audit::AuditLog;
use crate::config::{HumanLoopConfig, InfraMatch, InfrastructureConfig, RbacConfig};
use crate::error::PipelineError;
use crate::types::{Event, TaskRecommendation, TaskStatus};

type HmacSha256 = Hmac<Sha256>;

/// Output of the decision stage.
#[derive(Debug, Default)]
pub struct DecisionOutput {
    /// Tasks that cleared approval, in emission order.
    pub approved: Vec<TaskRecommendation>,

    /// Tasks awaiting approval; withheld from plan and guardrail counts.
    pub pending: Vec<TaskRecommendation>,

    /// How many infrastructure tasks were derived.
    pub generated_infra: usize,
}

/// Builds the signing message for a task.
#[must_use]
pub fn approval_message(event_id: &str, assignee_domain: &str, action: &str, tenant: &str) -> String {
    format!("{event_id}:{assignee_domain}:{action}:{tenant}")
}

/// Signs an approval message with an approver secret.
#[must_use]
pub fn sign_approval(secret: &SecretString, message: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(message.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

/// Constant-time token verification.
fn token_matches(secret: &SecretString, message: &str, token: &str) -> bool {
    let expected = sign_approval(secret, message);
    expected.as_bytes().ct_eq(token.as_bytes()).unwrap_u8() == 1
}

/// Runs the decision stage over governance-filtered events.
///
/// Audits `decision_done` with approved/pending/infra counts.
///
/// # Errors
///
/// Only fails if an audit append fails.
pub fn run(
    events: &[Event],
    rbac: &RbacConfig,
    human: &HumanLoopConfig,
    infra: &InfrastructureConfig,
    audit: &AuditLog,
) -> Result<DecisionOutput, PipelineError> {
    let mut out = DecisionOutput::default();

    for event in events {
        if event.status != "open" {
            continue;
        }

        let assignee = default_assignee(&event.domain);
        let tenant = event.tenant.clone().unwrap_or_else(|| "default".to_string());
        let rank = event.severity.rank();
        let priority = 5u8.saturating_sub(rank).max(1);
        let confidence = (0.5 + 0.1 * f64::from(rank)).clamp(0.0, 1.0);

        let base = TaskRecommendation {
            id: format!("task_{}", event.id),
            event_id: event.id.clone(),
            action: "investigate".to_string(),
            assignee_domain: assignee.clone(),
            priority,
            rationale: format!(
                "{} (severity={}, domain={})",
                event.summary, event.severity, event.domain
            ),
            confidence,
            infrastructure_type: None,
            asset_id: None,
            requires_approval: false,
            status: TaskStatus::PendingApproval,
            approved_by: None,
            tenant: tenant.clone(),
            hold_reason: None,
            hold_until_epoch: None,
        };
        push_evaluated(&mut out, base, &[], 0, rbac, human);

        let mut infra_seq = 0usize;
        for mapping in &infra.mappings {
            if !criteria_match(&mapping.criteria, event) {
                continue;
            }
            for template in &mapping.tasks {
                infra_seq += 1;
                let action_default = infra.action_defaults.get(&template.action);

                let mut extra_roles: Vec<String> = Vec::new();
                if let Some(roles) = &template.required_roles {
                    extra_roles.extend(roles.iter().cloned());
                }
                if let Some(defaults) = action_default {
                    extra_roles.extend(defaults.required_roles.iter().cloned());
                }
                let extra_min = template
                    .min_approvals
                    .unwrap_or(0)
                    .max(action_default.map_or(0, |d| d.min_approvals));

                let task = TaskRecommendation {
                    id: format!("task_{}_infra{infra_seq}", event.id),
                    event_id: event.id.clone(),
                    action: template.action.clone(),
                    assignee_domain: template
                        .assignee_domain
                        .clone()
                        .unwrap_or_else(|| assignee.clone()),
                    priority,
                    rationale: format!(
                        "{} {} ({}) in response to {}",
                        template.action, template.asset_id, template.infrastructure_type, event.id
                    ),
                    confidence,
                    infrastructure_type: Some(template.infrastructure_type.clone()),
                    asset_id: Some(template.asset_id.clone()),
                    requires_approval: false,
                    status: TaskStatus::PendingApproval,
                    approved_by: None,
                    tenant: tenant.clone(),
                    hold_reason: None,
                    hold_until_epoch: None,
                };
                out.generated_infra += 1;
                push_evaluated(&mut out, task, &extra_roles, extra_min, rbac, human);
            }
        }
    }

    audit.append(
        "decision_done",
        json!({
            "approved": out.approved.len(),
            "pending": out.pending.len(),
            "generated_infra": out.generated_infra,
        }),
    )?;
    Ok(out)
}

fn default_assignee(domain: &str) -> String {
    if domain == "multi" {
        "land".to_string()
    } else {
        domain.to_string()
    }
}

fn criteria_match(criteria: &InfraMatch, event: &Event) -> bool {
    if let Some(category) = &criteria.category {
        if category != &event.category {
            return false;
        }
    }
    if let Some(domain) = &criteria.domain {
        if domain != &event.domain {
            return false;
        }
    }
    true
}

/// Evaluates approval for one task and files it as approved or pending.
fn push_evaluated(
    out: &mut DecisionOutput,
    mut task: TaskRecommendation,
    extra_roles: &[String],
    extra_min: u32,
    rbac: &RbacConfig,
    human: &HumanLoopConfig,
) {
    task.requires_approval = human.default_require_approval
        || human.domain_require_approval.contains(&task.assignee_domain);

    // Union of domain-level, action-level, and task-level role demands.
    let mut required_roles: BTreeSet<String> = BTreeSet::new();
    if let Some(roles) = rbac.required_roles.get(&task.assignee_domain) {
        required_roles.extend(roles.iter().cloned());
    }
    if let Some(req) = rbac.action_requirements.get(&task.action) {
        required_roles.extend(req.required_roles.iter().cloned());
    }
    required_roles.extend(extra_roles.iter().cloned());

    // Maximum of all applicable minimums.
    let min_approvals = rbac
        .min_approvals
        .max(rbac.action_requirements.get(&task.action).map_or(0, |r| r.min_approvals))
        .max(extra_min);

    let message = approval_message(&task.event_id, &task.assignee_domain, &task.action, &task.tenant);
    let mut valid_ids: Vec<String> = Vec::new();
    let mut valid_roles: BTreeSet<String> = BTreeSet::new();
    for active in &rbac.active_approvers {
        let Some(approver) = rbac.approver(&active.id) else {
            continue;
        };
        if token_matches(&approver.secret, &message, &active.token) {
            valid_ids.push(approver.id.clone());
            valid_roles.extend(approver.roles.iter().cloned());
        }
    }

    let meets_policy = valid_ids.len() as u32 >= min_approvals
        && required_roles.is_subset(&valid_roles)
        && (human.auto_approve || !valid_ids.is_empty());

    if meets_policy {
        task.status = TaskStatus::Approved;
        task.approved_by = if valid_ids.is_empty() {
            Some(human.approver.clone())
        } else {
            Some(valid_ids.join(","))
        };
        tracing::debug!(task_id = %task.id, approvers = ?task.approved_by, "task approved");
        out.approved.push(task);
    } else if !task.requires_approval
        && min_approvals == 0
        && required_roles.is_empty()
        && human.allow_unsigned_auto_approve
    {
        task.status = TaskStatus::Approved;
        task.approved_by = Some(human.approver.clone());
        out.approved.push(task);
    } else {
        task.status = TaskStatus::PendingApproval;
        task.approved_by = None;
        out.pending.push(task);
    }
}
