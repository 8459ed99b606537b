//! Outbound HTTP with bounded retries, backoff, and a dead-letter queue.
//!
//! Shared by the `webhook` sink and infrastructure batch forwarding. Each
//! attempt uses the configured per-attempt timeout; total attempts are
//! `retries + 1`. After the final failure the payload is appended to the
//! DLQ file (one JSON line per payload) and the error surfaces as a
//! recoverable `ExportError::External`.

use std::thread;
use std::time::Duration;

use serde_json::Value;

use super::{ExportError, JsonlEffector};
use crate::config::{BackoffMode, HttpSinkConfig};

/// A configured HTTP POST target.
pub struct HttpPoster {
    cfg: HttpSinkConfig,
    client: reqwest::blocking::Client,
}

impl HttpPoster {
    /// Builds a client with the per-attempt timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the client cannot be constructed.
    pub fn new(cfg: &HttpSinkConfig) -> Result<Self, ExportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs_f64(cfg.timeout_seconds.max(0.1)))
            .build()
            .map_err(|err| ExportError::External(err.to_string()))?;
        Ok(Self {
            cfg: cfg.clone(),
            client,
        })
    }

    /// POSTs a JSON payload with retries; dead-letters on final failure.
    ///
    /// # Errors
    ///
    /// Returns `ExportError::External` after the last retry fails. The DLQ
    /// write happens before the error is returned.
    pub fn post_json(&self, payload: &Value) -> Result<(), ExportError> {
        let attempts = self.cfg.retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.client.post(&self.cfg.url).json(payload).send() {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url = %self.cfg.url, attempt, "http post delivered");
                    return Ok(());
                }
                Ok(response) => {
                    last_error = format!("status {}", response.status());
                }
                Err(err) => {
                    last_error = err.to_string();
                }
            }

            tracing::warn!(
                url = %self.cfg.url,
                attempt,
                attempts,
                error = %last_error,
                "http post attempt failed"
            );
            if attempt < attempts {
                thread::sleep(self.backoff_delay(attempt));
            }
        }

        self.dead_letter(payload)?;
        Err(ExportError::External(format!(
            "{} failed after {attempts} attempts: {last_error}",
            self.cfg.url
        )))
    }

    /// Delay before the attempt following `completed_attempts`.
    fn backoff_delay(&self, completed_attempts: u32) -> Duration {
        let base = self.cfg.backoff_seconds.max(0.0);
        let seconds = match self.cfg.backoff {
            BackoffMode::Linear => base * f64::from(completed_attempts),
            BackoffMode::Exponential => base * 2f64.powi(completed_attempts as i32 - 1),
        };
        Duration::from_secs_f64(seconds.min(300.0))
    }

    fn dead_letter(&self, payload: &Value) -> Result<(), ExportError> {
        let Some(dlq_path) = &self.cfg.dlq_path else {
            return Ok(());
        };
        JsonlEffector::new(dlq_path, None).emit(std::slice::from_ref(payload))?;
        tracing::info!(dlq = %dlq_path.display(), "payload dead-lettered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    /// Port 9 (discard) is almost never bound; connections fail fast.
    fn unreachable_cfg(dlq: Option<std::path::PathBuf>) -> HttpSinkConfig {
        HttpSinkConfig {
            url: "http://127.0.0.1:9/webhook".to_string(),
            timeout_seconds: 0.5,
            retries: 1,
            backoff_seconds: 0.0,
            backoff: BackoffMode::Linear,
            dlq_path: dlq,
        }
    }

    #[test]
    fn test_failure_writes_dlq_and_errors() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = dir.path().join("dlq.jsonl");
        let poster = HttpPoster::new(&unreachable_cfg(Some(dlq.clone()))).unwrap();

        let err = poster.post_json(&json!({"run": "r1"})).unwrap_err();
        assert!(matches!(err, ExportError::External(_)));

        let contents = std::fs::read_to_string(&dlq).unwrap();
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.contains(r#""run":"r1""#));
    }

    #[test]
    fn test_failure_without_dlq_still_errors() {
        let poster = HttpPoster::new(&unreachable_cfg(None)).unwrap();
        let err = poster.post_json(&json!({})).unwrap_err();
        assert_eq!(err.category(), "external_service");
    }

    #[test]
    fn test_backoff_schedules() {
        let mut cfg = unreachable_cfg(None);
        cfg.backoff_seconds = 2.0;
        let linear = HttpPoster::new(&cfg).unwrap();
        assert_eq!(linear.backoff_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(linear.backoff_delay(2), Duration::from_secs_f64(4.0));

        cfg.backoff = BackoffMode::Exponential;
        let exponential = HttpPoster::new(&cfg).unwrap();
        assert_eq!(exponential.backoff_delay(1), Duration::from_secs_f64(2.0));
        assert_eq!(exponential.backoff_delay(3), Duration::from_secs_f64(8.0));
    }
}
