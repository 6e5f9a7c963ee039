//! ASC Supervisor - process control and fleet reconciliation
//!
//! [`ReconciliationEngine`] diffs the running fleet against a new
//! configuration and issues the minimal set of stops and starts through a
//! [`ProcessControl`] implementation. [`LocalProcessSupervisor`] is the
//! concrete one: it spawns agents as local OS processes and keeps one
//! process record per agent in the state tree.
//!
//! Hook the engine into a [`ConfigWatcher`](asc_core::config::ConfigWatcher)
//! with [`ReconcileOnReload`], which serializes reconciliations behind a lock.
//! [`HealthMonitor`] shares that lock to restart agents that crash or stop
//! sending heartbeats.

mod error;
mod health;
mod process;
mod reconcile;

#[cfg(test)]
mod tests;

pub use error::{Result, SupervisorError};
pub use health::{
    AgentHealth, HealthConfig, HealthIssue, HealthIssueKind, HealthMonitor, HealthSeverity,
    RecoveryAction, RecoveryStats, StatusSource,
};
pub use process::{LocalProcessSupervisor, ProcessControl, SupervisorConfig};
pub use reconcile::{
    AgentAction, AgentError, COORDINATOR_PROCESS, ReconcileOnReload, ReconciliationEngine,
    ReconciliationResult, diff,
};
