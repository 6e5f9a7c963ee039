//! # ASC - Agent fleet control plane
//!
//! `asc-core` keeps a fleet of agent processes in line with a configuration
//! file and watches over it:
//! - Configuration model, validation and debounced hot-reload
//! - Liveness tracking from polled heartbeats and a self-reconnecting event stream
//! - Self-healing diagnostics for the on-disk state tree
//!
//! Process spawning and reconciliation live in `asc-supervisor`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use asc_core::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::load("asc.toml")?;
//!
//!     let client = CoordinatorClient::new(&config.services.coordinator.url)?;
//!     for status in client.get_all_agent_statuses(Duration::from_secs(120)).await? {
//!         println!("{}: {}", status.name, status.state);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod error;
pub mod liveness;
pub mod state;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{
        AgentConfig, Config, ConfigWatcher, ControllerSettings, CoordinatorConfig, Model,
        ReloadHandler, Template, ValidationWarning, load_env_file,
    };
    pub use crate::diagnostics::{
        Category, DiagnosticReport, Diagnostics, DiagnosticsConfig, FixResult, HttpProbe, Issue,
        IssueKind, NetworkProbe, PidProbe, Severity, SignalProbe,
    };
    pub use crate::error::{AscError, Result};
    pub use crate::liveness::{
        AgentState, AgentStatus, CoordinatorClient, Event, EventStreamClient, Heartbeat, Message,
        MessageType, RetryPolicy, StreamConfig,
    };
    pub use crate::state::{ProcessRecord, StateLayout, StateSubdir};
}
