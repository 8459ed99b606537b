//! Subcommand implementations.

pub mod simulate;
pub mod simulate_arms;
