//! Guardrails: rate caps and risk-budget holds over approved tasks.
//!
//! Caps apply in a fixed order: per-event, per-domain, total, per-asset
//! (exact asset ids first, then glob-style `*` patterns). Within each cap
//! the first N tasks in decision order survive. Every breach is audited as
//! `guardrail_drop`, and a run whose overall drop ratio exceeds
//! `health_alert_drop_ratio` additionally audits `guardrail_health_alert`.
//!
//! After the caps, the risk budget counts each surviving task whose source
//! event was critical into the persistent [`RiskStore`]. A task past the
//! tenant's budget rolls back to `risk_hold` with an exponentially growing
//! `hold_until_epoch`; held tasks never return to approved within the run.

use std::collections::HashMap;

use serde_json::json;

use crate::audit::AuditLog;
use crate::config::GuardrailsConfig;
use crate::error::PipelineError;
use crate::risk::RiskStore;
use crate::types::{Event, Severity, TaskRecommendation, TaskStatus};

/// Result of the guardrail stage.
#[derive(Debug, Default)]
pub struct GuardrailOutcome {
    /// Tasks that survived all caps and budgets, in decision order.
    pub kept: Vec<TaskRecommendation>,

    /// Tasks rolled back by a risk budget.
    pub risk_held: Vec<TaskRecommendation>,

    /// Tasks removed by rate caps.
    pub dropped: usize,
}

/// Applies rate caps and risk budgets to approved tasks.
///
/// # Errors
///
/// Returns `StoreError` when the risk store fails, or an audit error.
pub fn run(
    cfg: &GuardrailsConfig,
    tasks: Vec<TaskRecommendation>,
    events: &[Event],
    store: &RiskStore,
    audit: &AuditLog,
    now_epoch: i64,
) -> Result<GuardrailOutcome, PipelineError> {
    let initial = tasks.len();
    let (capped, drops) = apply_caps(cfg, tasks);

    let mut dropped_total = 0usize;
    for (rule, dropped_count) in &drops {
        if *dropped_count > 0 {
            dropped_total += dropped_count;
            audit.append(
                "guardrail_drop",
                json!({"rule": rule, "dropped_count": dropped_count}),
            )?;
        }
    }

    if initial > 0 {
        #[allow(clippy::cast_precision_loss)]
        let ratio = dropped_total as f64 / initial as f64;
        if ratio > cfg.health_alert_drop_ratio {
            tracing::warn!(dropped = dropped_total, initial, ratio, "guardrail drop ratio high");
            audit.append(
                "guardrail_health_alert",
                json!({"dropped": dropped_total, "initial": initial, "ratio": ratio}),
            )?;
        }
    }

    let severity_by_event: HashMap<&str, Severity> =
        events.iter().map(|e| (e.id.as_str(), e.severity)).collect();

    let mut out = GuardrailOutcome {
        dropped: dropped_total,
        ..GuardrailOutcome::default()
    };

    for mut task in capped {
        let is_critical = severity_by_event
            .get(task.event_id.as_str())
            .is_some_and(|s| *s == Severity::Critical);
        let budget = cfg.risk_budgets.get(&task.tenant);

        let (Some(budget), true) = (budget, is_critical) else {
            out.kept.push(task);
            continue;
        };

        let count = store.increment_and_get(&task.tenant, "critical", budget.window_sec, now_epoch)?;
        if count <= budget.max {
            out.kept.push(task);
            continue;
        }

        let overage = count - budget.max;
        let exponent = u32::try_from(overage - 1).unwrap_or(0).min(30);
        let backoff = cfg
            .risk_backoff_base_sec
            .saturating_mul(1_i64 << exponent);
        task.status = TaskStatus::RiskHold;
        task.hold_reason = Some("risk_budget_exceeded".to_string());
        task.hold_until_epoch = Some(now_epoch + backoff);
        audit.append(
            "risk_hold",
            json!({"task_id": task.id, "tenant": task.tenant, "count": count}),
        )?;
        out.risk_held.push(task);
    }

    Ok(out)
}

/// Applies the four rate caps in order, returning survivors and per-rule
/// drop counts.
fn apply_caps(
    cfg: &GuardrailsConfig,
    tasks: Vec<TaskRecommendation>,
) -> (Vec<TaskRecommendation>, Vec<(&'static str, usize)>) {
    let limits = &cfg.rate_limits;
    let mut drops: Vec<(&'static str, usize)> = Vec::new();

    // 1. Per-event cap.
    let mut survivors = tasks;
    if let Some(cap) = limits.per_event {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let before = survivors.len();
        survivors.retain(|task| {
            let count = counts.entry(task.event_id.clone()).or_insert(0);
            *count += 1;
            *count <= cap
        });
        drops.push(("per_event", before - survivors.len()));
    }

    // 2. Per-domain caps.
    if !limits.per_domain.is_empty() {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let before = survivors.len();
        survivors.retain(|task| {
            let Some(cap) = limits.per_domain.get(&task.assignee_domain) else {
                return true;
            };
            let count = counts.entry(task.assignee_domain.clone()).or_insert(0);
            *count += 1;
            *count <= *cap
        });
        drops.push(("per_domain", before - survivors.len()));
    }

    // 3. Total cap.
    if let Some(cap) = limits.total {
        let before = survivors.len();
        survivors.truncate(cap);
        drops.push(("total", before - survivors.len()));
    }

    // 4. Per-asset infrastructure caps.
    if !limits.per_asset_infra.is_empty() || !limits.per_asset_infra_patterns.is_empty() {
        let mut counts: HashMap<String, usize> = HashMap::new();
        let before = survivors.len();
        survivors.retain(|task| {
            let Some(asset_id) = task.asset_id.as_deref() else {
                return true;
            };
            if !task.is_infrastructure() {
                return true;
            }
            let cap = limits.per_asset_infra.get(asset_id).copied().or_else(|| {
                limits
                    .per_asset_infra_patterns
                    .iter()
                    .find(|p| glob_match(&p.pattern, asset_id))
                    .map(|p| p.n)
            });
            let Some(cap) = cap else {
                return true;
            };
            let count = counts.entry(asset_id.to_string()).or_insert(0);
            *count += 1;
            *count <= cap
        });
        drops.push(("per_asset_infra", before - survivors.len()));
    }

    (survivors, drops)
}

/// Glob-style matching where `*` matches any run of characters.
#[must_use]
pub fn glob_match(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') {
        return pattern == value;
    }

    let parts: Vec<&str> = pattern.split('*').collect();
    let first = parts[0];
    let last = parts[parts.len() - 1];

    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];

    for mid in &parts[1..parts.len() - 1] {
        if mid.is_empty() {
            continue;
        }
        match rest.find(mid) {
            Some(pos) => rest = &rest[pos + mid.len()..],
            None => return false,
        }
    }

    rest.ends_with(last)
}
