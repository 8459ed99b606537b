//! Reading producers: scenario documents, bounded file tailing, and the
//! media-modules adapter seam.
//!
//! Tail mode is the only stage loop that blocks on I/O. It polls at
//! `poll_interval_sec`, keeps a byte offset so every line is parsed once,
//! and stops after `max_items` readings or two consecutive polls with no new
//! content. Cancellation is honored between polls.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::audit::AuditLog;
use crate::config::{IngestConfig, IngestMode, MediaConfig, ModulesConfig};
use crate::error::PipelineError;
use crate::pipeline::CancelToken;
use crate::types::SensorReading;

/// External media-modules adapter (vision/audio/thermal/gait/scene).
///
/// The adapter itself is an external collaborator; the pipeline only knows
/// this seam. When no adapter is wired, `modules_media` mode yields no
/// readings and audits `ingest_modules_skipped`.
pub trait MediaAdapter: Send + Sync {
    /// Collects readings from the configured media source.
    ///
    /// # Errors
    ///
    /// Returns `InputFormat` when the media source cannot be interpreted.
    fn collect(
        &self,
        media: &MediaConfig,
        modules: &ModulesConfig,
    ) -> Result<Vec<SensorReading>, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct ScenarioDoc {
    #[serde(default)]
    sensor_readings: Vec<SensorReading>,
}

/// Runs the ingest stage in the configured mode.
///
/// Audits `ingest_done` with the reading count and mode.
///
/// # Errors
///
/// Returns `InputFormat` for malformed scenario input, `ConfigError` for
/// missing mode-specific options, and I/O errors from the tail loop.
pub fn run(
    cfg: &IngestConfig,
    mode: IngestMode,
    scenario_path: Option<&Path>,
    media: Option<&dyn MediaAdapter>,
    audit: &AuditLog,
    cancel: &CancelToken,
) -> Result<Vec<SensorReading>, PipelineError> {
    let readings = match mode {
        IngestMode::Scenario => {
            let path = scenario_path.ok_or_else(|| {
                PipelineError::Config("scenario mode requires a scenario path".to_string())
            })?;
            read_scenario(path)?
        }
        IngestMode::Tail => run_tail(cfg, audit, cancel)?,
        IngestMode::ModulesMedia => match media {
            Some(adapter) => adapter.collect(&cfg.media, &cfg.modules)?,
            None => {
                audit.append("ingest_modules_skipped", json!({"reason": "adapter unavailable"}))?;
                Vec::new()
            }
        },
    };

    tracing::info!(count = readings.len(), mode = mode.as_str(), "ingest complete");
    audit.append(
        "ingest_done",
        json!({"count": readings.len(), "mode": mode.as_str()}),
    )?;
    Ok(readings)
}

/// Parses a scenario document with a top-level `sensor_readings` list.
///
/// # Errors
///
/// Returns `InputFormat` when the document is unreadable, not YAML, or a
/// reading is missing a required key.
pub fn read_scenario(path: &Path) -> Result<Vec<SensorReading>, PipelineError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        PipelineError::InputFormat(format!("cannot read scenario {}: {err}", path.display()))
    })?;
    let doc: ScenarioDoc = serde_yaml::from_str(&raw).map_err(|err| {
        PipelineError::InputFormat(format!("invalid scenario {}: {err}", path.display()))
    })?;
    Ok(doc.sensor_readings)
}

/// Bounded tail polling over a line-delimited JSON file.
fn run_tail(
    cfg: &IngestConfig,
    audit: &AuditLog,
    cancel: &CancelToken,
) -> Result<Vec<SensorReading>, PipelineError> {
    let tail = &cfg.tail;
    let path = tail.path.as_ref().ok_or_else(|| {
        PipelineError::Config("ingest.tail.path is required for tail mode".to_string())
    })?;
    let poll = Duration::from_secs_f64(tail.poll_interval_sec.max(0.01));

    let mut items: Vec<SensorReading> = Vec::new();
    let mut offset: u64 = 0;
    let mut idle_polls = 0u8;
    let mut malformed = 0u64;

    loop {
        if cancel.is_cancelled() || items.len() >= tail.max_items {
            break;
        }

        let chunk = read_new_complete_lines(path, &mut offset)?;
        if chunk.is_empty() {
            idle_polls += 1;
            if idle_polls >= 2 {
                break;
            }
            thread::sleep(poll);
            continue;
        }
        idle_polls = 0;

        for line in chunk.lines() {
            if items.len() >= tail.max_items {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<SensorReading>(line) {
                Ok(reading) => items.push(reading),
                Err(err) => {
                    malformed += 1;
                    tracing::warn!(error = %err, "skipping malformed tail line");
                }
            }
        }
    }

    if malformed > 0 {
        audit.append("ingest_tail_malformed", json!({"count": malformed}))?;
    }
    Ok(items)
}

/// Reads complete lines past `offset`, advancing it. A trailing partial
/// line is left for the next poll.
fn read_new_complete_lines(path: &Path, offset: &mut u64) -> Result<String, PipelineError> {
    if !path.exists() {
        return Ok(String::new());
    }

    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(*offset))?;
    let mut data = String::new();
    file.read_to_string(&mut data)?;

    match data.rfind('\n') {
        None => Ok(String::new()),
        Some(last_newline) => {
            let complete = data[..=last_newline].to_string();
            *offset += complete.len() as u64;
            Ok(complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::config::AuditConfig;

    fn test_audit(dir: &Path) -> AuditLog {
        AuditLog::open(dir.join("audit_log.jsonl"), &AuditConfig::default()).unwrap()
    }

    fn tail_config(path: &Path, max_items: usize) -> IngestConfig {
        IngestConfig {
            mode: IngestMode::Tail,
            tail: crate::config::TailConfig {
                path: Some(path.to_path_buf()),
                max_items,
                poll_interval_sec: 0.01,
            },
            ..IngestConfig::default()
        }
    }

    #[test]
    fn test_scenario_parses_readings() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = dir.path().join("scenario.yaml");
        std::fs::write(
            &scenario,
            r"
sensor_readings:
  - {id: r1, sensor_id: s1, domain: cyber, source_type: netflow, ts_ms: 1000,
     details: {scan_count: 25}}
  - {id: r2, sensor_id: s2, domain: air, source_type: radar, ts_ms: 2000,
     geo: {lat: 1.5, lon: 2.5}}
",
        )
        .unwrap();

        let readings = read_scenario(&scenario).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].id, "r1");
        assert_eq!(readings[1].geo.unwrap().lat, 1.5);
    }

    #[test]
    fn test_scenario_missing_required_key_is_input_format() {
        let dir = tempfile::tempdir().unwrap();
        let scenario = dir.path().join("scenario.yaml");
        std::fs::write(
            &scenario,
            "sensor_readings:\n  - {id: r1, domain: cyber, source_type: netflow, ts_ms: 1}\n",
        )
        .unwrap();

        let err = read_scenario(&scenario).unwrap_err();
        assert!(matches!(err, PipelineError::InputFormat(_)));
        assert!(err.to_string().contains("sensor_id"));
    }

    #[test]
    fn test_tail_reads_and_counts_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("readings.jsonl");
        let mut f = std::fs::File::create(&data).unwrap();
        writeln!(
            f,
            r#"{{"id":"r1","sensor_id":"s1","domain":"cyber","source_type":"netflow","ts_ms":1}}"#
        )
        .unwrap();
        writeln!(f, "this is not json").unwrap();
        writeln!(
            f,
            r#"{{"id":"r2","sensor_id":"s1","domain":"cyber","source_type":"netflow","ts_ms":2}}"#
        )
        .unwrap();
        drop(f);

        let audit = test_audit(dir.path());
        let cfg = tail_config(&data, 100);
        let readings = run(
            &cfg,
            IngestMode::Tail,
            None,
            None,
            &audit,
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(readings.len(), 2);
        let log = std::fs::read_to_string(dir.path().join("audit_log.jsonl")).unwrap();
        assert!(log.contains("ingest_tail_malformed"));
        assert!(log.contains(r#""count":1"#));
    }

    #[test]
    fn test_tail_respects_max_items() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("readings.jsonl");
        let mut f = std::fs::File::create(&data).unwrap();
        for i in 0..10 {
            writeln!(
                f,
                r#"{{"id":"r{i}","sensor_id":"s1","domain":"cyber","source_type":"netflow","ts_ms":{i}}}"#
            )
            .unwrap();
        }
        drop(f);

        let audit = test_audit(dir.path());
        let cfg = tail_config(&data, 3);
        let readings = run(
            &cfg,
            IngestMode::Tail,
            None,
            None,
            &audit,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(readings.len(), 3);
    }

    #[test]
    fn test_tail_stops_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let audit = test_audit(dir.path());
        let cfg = tail_config(&dir.path().join("never.jsonl"), 100);
        let readings = run(
            &cfg,
            IngestMode::Tail,
            None,
            None,
            &audit,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn test_tail_honors_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let audit = test_audit(dir.path());
        let cfg = tail_config(&dir.path().join("never.jsonl"), 100);
        let cancel = CancelToken::new();
        cancel.cancel();
        let readings = run(&cfg, IngestMode::Tail, None, None, &audit, &cancel).unwrap();
        assert!(readings.is_empty());
    }

    #[test]
    fn test_modules_media_without_adapter_audits_skip() {
        let dir = tempfile::tempdir().unwrap();
        let audit = test_audit(dir.path());
        let cfg = IngestConfig::default();
        let readings = run(
            &cfg,
            IngestMode::ModulesMedia,
            None,
            None,
            &audit,
            &CancelToken::new(),
        )
        .unwrap();
        assert!(readings.is_empty());
        let log = std::fs::read_to_string(dir.path().join("audit_log.jsonl")).unwrap();
        assert!(log.contains("ingest_modules_skipped"));
        assert!(log.contains("ingest_done"));
    }

    #[test]
    fn test_partial_trailing_line_is_deferred() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("readings.jsonl");
        std::fs::write(&data, "{\"id\":\"r1\"").unwrap();

        let mut offset = 0u64;
        let chunk = read_new_complete_lines(&data, &mut offset).unwrap();
        assert!(chunk.is_empty());
        assert_eq!(offset, 0);
    }
}
