//! Top-level error taxonomy for pipeline runs.
//!
//! Stage-local errors (audit, risk store, ingest, export) live next to the
//! code that raises them; this module defines the roll-up that crosses the
//! library boundary and the process exit codes the CLI maps it to.
//!
//! Propagation policy: `Config`, `InputFormat`, `AuditTampered`,
//! `AuditUnsigned`, `Store`, and `Io` are fatal and abort the run after a
//! final `run_failed` audit entry. Export-sink and external-service failures
//! are recoverable: they are audited and counted but never surface as a
//! `PipelineError`.

use thiserror::Error;

use crate::audit::AuditError;
use crate::risk::RiskStoreError;

/// Process exit code for configuration errors.
pub const EXIT_CONFIG: i32 = 2;

/// Process exit code for audit integrity failures.
pub const EXIT_AUDIT: i32 = 3;

/// Process exit code for unrecoverable I/O errors.
pub const EXIT_IO: i32 = 4;

/// Fatal errors that abort a pipeline run.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PipelineError {
    /// Malformed configuration, unknown enum values, or duplicate ids.
    #[error("ConfigError: {0}")]
    Config(String),

    /// Malformed scenario or tail input.
    #[error("InputFormat: {0}")]
    InputFormat(String),

    /// The audit log failed hash-chain verification.
    #[error("AuditTampered: {0}")]
    AuditTampered(String),

    /// Signing is required but an audit entry lacks a signature.
    #[error("AuditUnsigned: {0}")]
    AuditUnsigned(String),

    /// The risk store is unavailable or rejected a transaction.
    #[error("StoreError: {0}")]
    Store(String),

    /// Unrecoverable I/O failure outside a specific sink.
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// The spec'd error category, used in diagnostics and audit payloads.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match self {
            Self::Config(_) => "ConfigError",
            Self::InputFormat(_) => "InputFormat",
            Self::AuditTampered(_) => "AuditTampered",
            Self::AuditUnsigned(_) => "AuditUnsigned",
            Self::Store(_) => "StoreError",
            Self::Io(_) => "IoError",
        }
    }

    /// The process exit code this error maps to.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::InputFormat(_) => EXIT_CONFIG,
            Self::AuditTampered(_) | Self::AuditUnsigned(_) => EXIT_AUDIT,
            Self::Store(_) | Self::Io(_) => EXIT_IO,
        }
    }
}

impl From<AuditError> for PipelineError {
    fn from(err: AuditError) -> Self {
        match err {
            AuditError::Tampered { .. } => Self::AuditTampered(err.to_string()),
            AuditError::Unsigned { .. } => Self::AuditUnsigned(err.to_string()),
            AuditError::Io(io) => Self::Io(io),
            AuditError::Malformed { .. } => Self::AuditTampered(err.to_string()),
        }
    }
}

impl From<RiskStoreError> for PipelineError {
    fn from(err: RiskStoreError) -> Self {
        Self::Store(err.to_string())
    }
}
