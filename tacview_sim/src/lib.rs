//! tacview Deterministic Simulation Harness
//!
//! Drives a [`tacview_core::TacticalEngine`] against a ground-truth oracle
//! on a virtual clock, so every lifecycle path can be replayed from a seed.
//!
//! # Sources of non-determinism, and how they are pinned
//! - **Time**: `SimContext` only moves when the runner advances it
//! - **Randomness**: unit placement, noise and chaos all derive from one seed
//! - **Scheduling**: the runner calls `sweep` and `drain_inbound` itself
//!   instead of relying on background tasks
//!
//! # Usage
//!
//! ```ignore
//! use tacview_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::StaleChurn);
//! assert!(result.passed);
//! ```

mod context;
mod exporter;
mod oracle;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use exporter::{EntityFrame, SimExport, SimFrame, UnitPosition};
pub use oracle::{Malformation, Oracle, SimUnit};
pub use runner::{InvariantMonitor, ScenarioMetrics, ScenarioResult, ScenarioRunner};
