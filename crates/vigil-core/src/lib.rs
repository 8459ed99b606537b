//! # vigil-core
//!
//! Core library for vigil - a simulation-focused, multi-domain incident
//! pipeline with an enforced oversight envelope.
//!
//! A single run consumes sensor-like observations, derives events via
//! declarative rules, proposes human-approvable task recommendations, and
//! pushes everything through policy filtering, signed-token approval gating,
//! guardrails and risk budgets before exporting artifacts for downstream
//! inspection. Two pieces of state make oversight auditable across runs:
//!
//! - **Audit log**: an append-only, hash-chained (optionally HMAC-signed)
//!   JSONL file. See [`audit`].
//! - **Risk store**: `SQLite`-backed, time-windowed risk counters. See
//!   [`risk`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use vigil_core::config::Config;
//! use vigil_core::pipeline::{Pipeline, RunOptions};
//!
//! # fn example() -> Result<(), vigil_core::error::PipelineError> {
//! let loaded = Config::load("configs/default.yaml", None)?;
//! let pipeline = Pipeline::new(loaded);
//! let summary = pipeline.run(&RunOptions {
//!     scenario_path: Some("scenarios/port_scan.yaml".into()),
//!     out_dir: "out/run1".into(),
//! })?;
//! println!("{} events, {} tasks", summary.events, summary.approved_tasks);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod audit;
pub mod autonomy;
pub mod canonical;
pub mod config;
pub mod decision;
pub mod error;
pub mod export;
pub mod fusion;
pub mod governance;
pub mod guardrails;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod risk;
pub mod rules;
pub mod types;

pub use config::Config;
pub use error::PipelineError;
pub use pipeline::{Pipeline, RunOptions, RunSummary};
