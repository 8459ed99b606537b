//! Fusion: groups readings into entity track summaries.
//!
//! One track per `(domain, track key)` where the key is `details.track_id`
//! or `anon_<domain>_<sensor_id>` for readings without one. Output is
//! deterministically ordered by track id.

use std::collections::BTreeMap;

use serde_json::json;

use crate::audit::AuditLog;
use crate::error::PipelineError;
use crate::types::{EntityTrack, SensorReading};

/// Result of the fusion stage.
#[derive(Debug, Default)]
pub struct FusionOutput {
    /// Tracks keyed by track id.
    pub tracks: BTreeMap<String, EntityTrack>,

    /// Reading counts per domain.
    pub domain_counts: BTreeMap<String, u64>,
}

/// Groups readings into tracks and counts readings per domain.
///
/// Audits `fusion_done` with the track and domain summaries.
///
/// # Errors
///
/// Only fails if the audit append fails.
pub fn run(readings: &[SensorReading], audit: &AuditLog) -> Result<FusionOutput, PipelineError> {
    let mut out = FusionOutput::default();

    for reading in readings {
        *out.domain_counts.entry(reading.domain.clone()).or_insert(0) += 1;

        let track_id = reading
            .detail_str("track_id")
            .map_or_else(
                || format!("anon_{}_{}", reading.domain, reading.sensor_id),
                String::from,
            );

        out.tracks
            .entry(track_id.clone())
            .and_modify(|track| {
                track.last_seen_ms = track.last_seen_ms.max(reading.ts_ms);
            })
            .or_insert_with(|| EntityTrack {
                id: track_id,
                domain: reading.domain.clone(),
                label: format!("{}_track", reading.domain),
                attributes: serde_json::Map::new(),
                last_seen_ms: reading.ts_ms,
            });
    }

    audit.append(
        "fusion_done",
        json!({"tracks": out.tracks.len(), "domains": out.domain_counts}),
    )?;
    Ok(out)
}
