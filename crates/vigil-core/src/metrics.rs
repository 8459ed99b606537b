//! In-memory counters and stage timers, with Prometheus text rendering.
//!
//! The recorder is shared across stages through the run context; the
//! `metrics` export sink renders it into `metrics.prom`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

/// Lightweight metrics recorder for pipeline observability.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, f64>>,
    timings: Mutex<BTreeMap<String, f64>>,
}

impl Metrics {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to a named counter.
    pub fn inc_by(&self, name: &str, value: f64) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *counters.entry(name.to_string()).or_insert(0.0) += value;
    }

    /// Increments a named counter by one.
    pub fn inc(&self, name: &str) {
        self.inc_by(name, 1.0);
    }

    /// Runs `f`, accumulating its wall time under `<name>` and bumping
    /// `<name>_count`.
    pub fn time<T>(&self, name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed().as_secs_f64();

        let mut timings = self
            .timings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *timings.entry(name.to_string()).or_insert(0.0) += elapsed;
        drop(timings);
        self.inc(&format!("{name}_count"));
        result
    }

    /// Current counter values, sorted by name.
    #[must_use]
    pub fn counters(&self) -> BTreeMap<String, f64> {
        self.counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Renders the Prometheus text exposition format.
    #[must_use]
    pub fn render_prometheus(&self) -> String {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let timings = self
            .timings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        let mut out = String::new();
        for (name, value) in &counters {
            let metric = format!("vigil_{}", sanitize(name));
            out.push_str(&format!("# HELP {metric} Pipeline counter {name}.\n"));
            out.push_str(&format!("# TYPE {metric} counter\n"));
            out.push_str(&format!("{metric} {value}\n"));
        }
        for (name, value) in &timings {
            let metric = format!("vigil_{}_seconds", sanitize(name));
            out.push_str(&format!("# HELP {metric} Accumulated wall time for {name}.\n"));
            out.push_str(&format!("# TYPE {metric} gauge\n"));
            out.push_str(&format!("{metric} {value}\n"));
        }
        out
    }
}

/// Maps arbitrary counter names onto the Prometheus name charset.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.inc("events_total");
        m.inc("events_total");
        m.inc_by("tasks_approved", 3.0);
        let counters = m.counters();
        assert_eq!(counters["events_total"], 2.0);
        assert_eq!(counters["tasks_approved"], 3.0);
    }

    #[test]
    fn test_timer_records_duration_and_count() {
        let m = Metrics::new();
        let answer = m.time("rules", || 42);
        assert_eq!(answer, 42);
        assert_eq!(m.counters()["rules_count"], 1.0);
        let rendered = m.render_prometheus();
        assert!(rendered.contains("vigil_rules_seconds"));
    }

    #[test]
    fn test_prometheus_format_has_help_and_type() {
        let m = Metrics::new();
        m.inc("readings.total");
        let text = m.render_prometheus();
        assert!(text.contains("# HELP vigil_readings_total"));
        assert!(text.contains("# TYPE vigil_readings_total counter"));
        assert!(text.contains("vigil_readings_total 1\n"));
    }
}
