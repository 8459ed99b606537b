//! Append-only, hash-chained audit log.
//!
//! Every pipeline decision that matters lands here as one JSON line. Each
//! entry links to its predecessor through a SHA-256 hash chain and may carry
//! an HMAC-SHA256 signature, making the log tamper-evident: changing any
//! byte of any past line breaks verification at that line or a later one.
//!
//! # Chain construction
//!
//! The canonical fields of an entry are the canonical JSON of
//! `{actor, event, payload, prev_hash, seq, ts_iso}` (sorted keys, no
//! whitespace). Then:
//!
//! ```text
//! hash = hex(SHA-256(prev_hash_hex || canonical_fields))
//! sig  = base64url_nopad(HMAC-SHA256(sign_secret, hash))   // if configured
//! ```
//!
//! The first entry's `prev_hash` is 64 zeros. The chain resumes across
//! runs: opening an existing file picks up the last `seq` and `hash`.
//!
//! # Concurrency
//!
//! Single-writer: the file handle and chain head live behind a mutex.
//! Verification reads require exclusive access and happen before the writer
//! is constructed.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::canonical;
use crate::config::AuditConfig;

type HmacSha256 = Hmac<Sha256>;

/// `prev_hash` of the first entry in a chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Errors raised by the audit log.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuditError {
    /// I/O failure on the audit file.
    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line failed hash-chain verification.
    #[error("hash chain broken at line {line}: {details}")]
    Tampered {
        /// 1-based line number of the first bad entry.
        line: usize,
        /// What failed to match.
        details: String,
    },

    /// Signing is required but a line carries no signature.
    #[error("unsigned entry at line {line}")]
    Unsigned {
        /// 1-based line number of the unsigned entry.
        line: usize,
    },

    /// A line is not a valid audit entry.
    #[error("malformed audit entry at line {line}: {details}")]
    Malformed {
        /// 1-based line number.
        line: usize,
        /// Parse failure description.
        details: String,
    },
}

/// One audit log entry, as serialized to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Strictly monotonic sequence number, starting at 1.
    pub seq: u64,

    /// Entry kind (`run_start`, `ingest_done`, `guardrail_drop`, ...).
    pub event: String,

    /// ISO-8601 timestamp with millisecond precision.
    pub ts_iso: String,

    /// Configured actor, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    /// Structured entry payload.
    pub payload: Value,

    /// Hash of the previous entry, or [`GENESIS_HASH`].
    pub prev_hash: String,

    /// Hash of this entry.
    pub hash: String,

    /// HMAC signature over `hash`, when signing is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<String>,
}

/// Computes the chain hash for an entry's fields.
fn chain_hash(
    seq: u64,
    event: &str,
    ts_iso: &str,
    actor: Option<&str>,
    payload: &Value,
    prev_hash: &str,
) -> String {
    let fields = json!({
        "actor": actor,
        "event": event,
        "payload": payload,
        "prev_hash": prev_hash,
        "seq": seq,
        "ts_iso": ts_iso,
    });
    let mut input = String::from(prev_hash);
    input.push_str(&canonical::to_canonical_string(&fields));
    canonical::sha256_hex(input.as_bytes())
}

/// Signs a chain hash with the configured secret.
fn sign_hash(secret: &SecretString, hash: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .expect("HMAC accepts any key length");
    mac.update(hash.as_bytes());
    URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
}

#[derive(Debug)]
struct AuditInner {
    writer: BufWriter<File>,
    seq: u64,
    prev_hash: String,
}

/// The append-only audit sink.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    actor: Option<String>,
    sign_secret: Option<SecretString>,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    /// Opens (or creates) the audit file and positions the chain head.
    ///
    /// With `verify_on_start` the whole existing file is verified first;
    /// otherwise only the last line is read to resume the chain.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Tampered`] / [`AuditError::Unsigned`] on
    /// verification failure, [`AuditError::Malformed`] when the tail of an
    /// unverified file cannot be parsed, and I/O errors otherwise.
    pub fn open(path: impl AsRef<Path>, cfg: &AuditConfig) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let (seq, prev_hash) = if path.exists() {
            if cfg.verify_on_start {
                verify_file(&path, cfg.require_signing, cfg.sign_secret.as_ref())?
            } else {
                read_chain_head(&path)?
            }
        } else {
            (0, GENESIS_HASH.to_string())
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            actor: cfg.actor.clone(),
            sign_secret: cfg.sign_secret.clone(),
            inner: Mutex::new(AuditInner {
                writer: BufWriter::new(file),
                seq,
                prev_hash,
            }),
        })
    }

    /// Path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one entry, flushing it to disk before returning.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the line cannot be written or flushed.
    pub fn append(&self, event: &str, payload: Value) -> Result<u64, AuditError> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let seq = inner.seq + 1;
        let ts_iso = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let prev_hash = inner.prev_hash.clone();
        let hash = chain_hash(
            seq,
            event,
            &ts_iso,
            self.actor.as_deref(),
            &payload,
            &prev_hash,
        );
        let sig = self.sign_secret.as_ref().map(|s| sign_hash(s, &hash));

        let entry = AuditEntry {
            seq,
            event: event.to_string(),
            ts_iso,
            actor: self.actor.clone(),
            payload,
            prev_hash,
            hash: hash.clone(),
            sig,
        };

        let line = serde_json::to_string(&entry)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        inner.writer.write_all(line.as_bytes())?;
        inner.writer.write_all(b"\n")?;
        inner.writer.flush()?;

        inner.seq = seq;
        inner.prev_hash = hash;
        tracing::debug!(seq, event, "audit entry appended");
        Ok(seq)
    }
}

/// Verifies an audit file line by line, returning the final chain head.
///
/// # Errors
///
/// Returns the first integrity failure found, as described in
/// [`AuditLog::open`].
pub fn verify_file(
    path: &Path,
    require_signing: bool,
    sign_secret: Option<&SecretString>,
) -> Result<(u64, String), AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut expected_prev = GENESIS_HASH.to_string();
    let mut last_seq = 0u64;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let entry: AuditEntry =
            serde_json::from_str(&line).map_err(|err| AuditError::Malformed {
                line: line_no,
                details: err.to_string(),
            })?;

        if entry.prev_hash != expected_prev {
            return Err(AuditError::Tampered {
                line: line_no,
                details: format!(
                    "prev_hash {} does not match previous entry hash {expected_prev}",
                    entry.prev_hash
                ),
            });
        }

        let recomputed = chain_hash(
            entry.seq,
            &entry.event,
            &entry.ts_iso,
            entry.actor.as_deref(),
            &entry.payload,
            &entry.prev_hash,
        );
        if recomputed.as_bytes().ct_eq(entry.hash.as_bytes()).unwrap_u8() == 0 {
            return Err(AuditError::Tampered {
                line: line_no,
                details: "recomputed hash does not match stored hash".to_string(),
            });
        }

        match (&entry.sig, sign_secret) {
            (None, _) if require_signing => {
                return Err(AuditError::Unsigned { line: line_no });
            }
            (Some(sig), Some(secret)) => {
                let expected_sig = sign_hash(secret, &entry.hash);
                if expected_sig.as_bytes().ct_eq(sig.as_bytes()).unwrap_u8() == 0 {
                    return Err(AuditError::Tampered {
                        line: line_no,
                        details: "signature does not verify".to_string(),
                    });
                }
            }
            _ => {}
        }

        expected_prev = entry.hash;
        last_seq = entry.seq;
    }

    Ok((last_seq, expected_prev))
}

/// Reads the last entry of an existing file to resume the chain.
fn read_chain_head(path: &Path) -> Result<(u64, String), AuditError> {
    let reader = BufReader::new(File::open(path)?);
    let mut head = (0u64, GENESIS_HASH.to_string());
    let mut line_no = 0usize;

    for line in reader.lines() {
        line_no += 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let entry: AuditEntry =
            serde_json::from_str(&line).map_err(|err| AuditError::Malformed {
                line: line_no,
                details: err.to_string(),
            })?;
        head = (entry.seq, entry.hash);
    }

    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_log.jsonl");
        (dir, path)
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_chain_links_entries() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
        log.append("run_start", json!({"run_id": "r1"})).unwrap();
        log.append("ingest_done", json!({"count": 3})).unwrap();
        drop(log);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 2);
        let first: AuditEntry = serde_json::from_str(&lines[0]).unwrap();
        let second: AuditEntry = serde_json::from_str(&lines[1]).unwrap();
        assert_eq!(first.seq, 1);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.seq, 2);
        assert_eq!(second.prev_hash, first.hash);
    }

    #[test]
    fn test_verify_accepts_untampered_file() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
        for i in 0..5 {
            log.append("tick", json!({"i": i})).unwrap();
        }
        drop(log);

        let (seq, _) = verify_file(&path, false, None).unwrap();
        assert_eq!(seq, 5);
    }

    #[test]
    fn test_verify_detects_payload_mutation() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
        log.append("tick", json!({"i": 0})).unwrap();
        log.append("tick", json!({"i": 1})).unwrap();
        drop(log);

        // Flip one byte in the first line's payload.
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen(r#"{"i":0}"#, r#"{"i":9}"#, 1);
        assert_ne!(contents, tampered);
        std::fs::write(&path, tampered).unwrap();

        let err = verify_file(&path, false, None).unwrap_err();
        assert!(matches!(err, AuditError::Tampered { line: 1, .. }));
    }

    #[test]
    fn test_verify_detects_broken_link() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
        log.append("tick", json!({"i": 0})).unwrap();
        log.append("tick", json!({"i": 1})).unwrap();
        log.append("tick", json!({"i": 2})).unwrap();
        drop(log);

        // Remove the middle line; the chain must break at the next one.
        let lines = read_lines(&path);
        std::fs::write(&path, format!("{}\n{}\n", lines[0], lines[2])).unwrap();

        let err = verify_file(&path, false, None).unwrap_err();
        assert!(matches!(err, AuditError::Tampered { line: 2, .. }));
    }

    #[test]
    fn test_signed_entries_verify_and_reject_wrong_secret() {
        let (_dir, path) = temp_log();
        let cfg = AuditConfig {
            sign_secret: Some(SecretString::from("topsecret".to_string())),
            ..AuditConfig::default()
        };
        let log = AuditLog::open(&path, &cfg).unwrap();
        log.append("tick", json!({})).unwrap();
        drop(log);

        let good = SecretString::from("topsecret".to_string());
        verify_file(&path, true, Some(&good)).unwrap();

        let bad = SecretString::from("wrong".to_string());
        let err = verify_file(&path, true, Some(&bad)).unwrap_err();
        assert!(matches!(err, AuditError::Tampered { .. }));
    }

    #[test]
    fn test_require_signing_rejects_unsigned() {
        let (_dir, path) = temp_log();
        let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
        log.append("tick", json!({})).unwrap();
        drop(log);

        let err = verify_file(&path, true, None).unwrap_err();
        assert!(matches!(err, AuditError::Unsigned { line: 1 }));
    }

    #[test]
    fn test_chain_resumes_across_opens() {
        let (_dir, path) = temp_log();
        {
            let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
            log.append("run_start", json!({})).unwrap();
        }
        {
            let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
            log.append("run_start", json!({})).unwrap();
        }

        let (seq, _) = verify_file(&path, false, None).unwrap();
        assert_eq!(seq, 2);
    }

    #[test]
    fn test_open_with_verify_on_start_fails_on_tamper() {
        let (_dir, path) = temp_log();
        {
            let log = AuditLog::open(&path, &AuditConfig::default()).unwrap();
            log.append("tick", json!({"n": 1})).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, contents.replacen("tick", "tock", 1)).unwrap();

        let cfg = AuditConfig {
            verify_on_start: true,
            ..AuditConfig::default()
        };
        let err = AuditLog::open(&path, &cfg).unwrap_err();
        assert!(matches!(err, AuditError::Tampered { .. }));
    }

    #[test]
    fn test_actor_recorded_on_entries() {
        let (_dir, path) = temp_log();
        let cfg = AuditConfig {
            actor: Some("sim_operator".to_string()),
            ..AuditConfig::default()
        };
        let log = AuditLog::open(&path, &cfg).unwrap();
        log.append("tick", json!({})).unwrap();
        drop(log);

        let entry: AuditEntry = serde_json::from_str(&read_lines(&path)[0]).unwrap();
        assert_eq!(entry.actor.as_deref(), Some("sim_operator"));
    }
}
