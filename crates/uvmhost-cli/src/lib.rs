//! Plan runner for the uvmhost lifecycle orchestrator.
//!
//! Loads configuration from the environment, executes a JSON creation
//! plan against the simulated engine and produces a JSON report.

pub mod config;
pub mod plan;

pub use config::{ConfigError, PlanConfig, LOCK_FILE_NAME};
pub use plan::{EntryReport, Plan, PlanEntry, PlanRunner, Report, UnitKind};
