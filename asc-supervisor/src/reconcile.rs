//! Fleet reconciliation: converge running agents onto a configuration

use crate::process::ProcessControl;
use crate::{Result, SupervisorError};
use asc_core::config::{AgentConfig, Config, ReloadHandler};
use asc_core::error::AscError;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::Span;

/// Process name the coordination server runs under
pub const COORDINATOR_PROCESS: &str = "coordinator-server";

/// What was being done to an agent when it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentAction {
    Start,
    Stop,
    Restart,
}

impl fmt::Display for AgentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentAction::Start => write!(f, "start"),
            AgentAction::Stop => write!(f, "stop"),
            AgentAction::Restart => write!(f, "restart"),
        }
    }
}

/// A single agent's failure during reconciliation
#[derive(Debug)]
pub struct AgentError {
    pub agent: String,
    pub action: AgentAction,
    pub error: SupervisorError,
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to {} agent {}: {}", self.action, self.agent, self.error)
    }
}

/// Report of reconciliation actions
///
/// `added`, `removed` and `updated` are disjoint and computed before any
/// process is touched, so they describe the intended change even when some
/// actions fail.
#[derive(Debug, Default)]
pub struct ReconciliationResult {
    /// Agents that were started
    pub added: BTreeSet<String>,
    /// Agents that were stopped
    pub removed: BTreeSet<String>,
    /// Agents that were restarted with a new definition
    pub updated: BTreeSet<String>,
    pub errors: Vec<AgentError>,
}

impl ReconciliationResult {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty())
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Compute which agents `new` adds, removes or changes relative to `old`.
pub fn diff(old: &Config, new: &Config) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();

    for name in old.agents.keys() {
        if !new.agents.contains_key(name) {
            result.removed.insert(name.clone());
        }
    }

    for (name, agent) in &new.agents {
        match old.agents.get(name) {
            None => {
                result.added.insert(name.clone());
            }
            Some(previous) if agent_changed(previous, agent) => {
                result.updated.insert(name.clone());
            }
            Some(_) => {}
        }
    }

    result
}

/// Command and model compare exactly; phases compare as a multiset.
fn agent_changed(old: &AgentConfig, new: &AgentConfig) -> bool {
    if old.command != new.command || old.model != new.model {
        return true;
    }

    let mut old_phases: Vec<&str> = old.phases.iter().map(String::as_str).collect();
    let mut new_phases: Vec<&str> = new.phases.iter().map(String::as_str).collect();
    old_phases.sort_unstable();
    new_phases.sort_unstable();
    old_phases != new_phases
}

/// Holds the applied configuration and drives [`ProcessControl`] towards new ones.
///
/// Not safe for concurrent use against the same process handle; share it
/// behind a single-writer lock such as [`ReconcileOnReload`] does.
pub struct ReconciliationEngine {
    current: Config,
    processes: Arc<dyn ProcessControl>,
    secrets: BTreeMap<String, String>,
    span: Span,
}

impl ReconciliationEngine {
    /// `secrets` is passed to every agent started by this engine.
    pub fn new(
        current: Config,
        processes: Arc<dyn ProcessControl>,
        secrets: BTreeMap<String, String>,
    ) -> Self {
        Self {
            current,
            processes,
            secrets,
            span: tracing::info_span!("reconciler"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// The configuration the next reload is diffed against
    pub fn current(&self) -> &Config {
        &self.current
    }

    /// Start every agent of the current configuration.
    pub async fn start_all(&self) -> ReconciliationResult {
        let mut result = ReconciliationResult {
            added: self.current.agents.keys().cloned().collect(),
            ..Default::default()
        };

        for (name, agent) in &self.current.agents {
            if let Err(error) = self.start_agent(name, agent, &self.current).await {
                self.record(&mut result, name, AgentAction::Start, error);
            }
        }

        result
    }

    /// Converge onto `new`: stop removed agents, restart updated ones, then
    /// start added ones.
    ///
    /// Failures are collected per agent and never stop the rest of the fleet.
    /// `new` becomes the current configuration whatever the outcome, and
    /// failed starts are not retried.
    pub async fn reload(&mut self, new: Config) -> ReconciliationResult {
        let mut result = diff(&self.current, &new);
        tracing::info!(
            parent: &self.span,
            added = result.added.len(),
            removed = result.removed.len(),
            updated = result.updated.len(),
            "reconciling"
        );

        let removed: Vec<String> = result.removed.iter().cloned().collect();
        for name in removed {
            if let Err(error) = self.stop_agent(&name).await {
                self.record(&mut result, &name, AgentAction::Stop, error);
            }
        }

        let updated: Vec<String> = result.updated.iter().cloned().collect();
        for name in updated {
            if let Err(error) = self.stop_agent(&name).await {
                self.record(&mut result, &name, AgentAction::Stop, error);
                continue;
            }
            let agent = &new.agents[&name];
            if let Err(error) = self.start_agent(&name, agent, &new).await {
                self.record(&mut result, &name, AgentAction::Restart, error);
            }
        }

        let added: Vec<String> = result.added.iter().cloned().collect();
        for name in added {
            let agent = &new.agents[&name];
            if let Err(error) = self.start_agent(&name, agent, &new).await {
                self.record(&mut result, &name, AgentAction::Start, error);
            }
        }

        self.current = new;
        result
    }

    /// Stop every agent of the current configuration, leaving the
    /// configuration itself in place.
    pub async fn stop_all(&self) -> ReconciliationResult {
        let mut result = ReconciliationResult {
            removed: self.current.agents.keys().cloned().collect(),
            ..Default::default()
        };

        for name in self.current.agents.keys() {
            if let Err(error) = self.stop_agent(name).await {
                self.record(&mut result, name, AgentAction::Stop, error);
            }
        }

        result
    }

    /// Stop `name` if it is running and start it again from the current
    /// configuration.
    ///
    /// # Errors
    ///
    /// [`SupervisorError::NotFound`] if the current configuration has no such
    /// agent, otherwise the first failing stop or start.
    pub async fn restart_agent(&self, name: &str) -> Result<()> {
        let agent = self
            .current
            .agents
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        self.stop_agent(name).await?;
        self.start_agent(name, agent, &self.current).await
    }

    /// Whether `name` has a tracked process that is still alive
    pub async fn is_agent_running(&self, name: &str) -> bool {
        match self.processes.process_info(name).await {
            Ok(info) => self.processes.is_running(info.pid).await,
            Err(_) => false,
        }
    }

    /// Launch the coordination server from `services.coordinator.start_command`.
    ///
    /// It runs under [`COORDINATOR_PROCESS`] with the captured secrets as its
    /// environment.
    pub async fn start_coordinator(&self) -> Result<u32> {
        let (program, args) = self
            .current
            .services
            .coordinator
            .program_and_args()
            .ok_or_else(|| SupervisorError::EmptyCommand(COORDINATOR_PROCESS.to_string()))?;

        let pid = self
            .processes
            .start(COORDINATOR_PROCESS, &program, &args, &self.secrets)
            .await?;
        tracing::info!(parent: &self.span, pid, "coordination server started");
        Ok(pid)
    }

    /// Stop the coordination server. Succeeds if it is not running.
    pub async fn stop_coordinator(&self) -> Result<()> {
        self.stop_agent(COORDINATOR_PROCESS).await
    }

    fn record(
        &self,
        result: &mut ReconciliationResult,
        agent: &str,
        action: AgentAction,
        error: SupervisorError,
    ) {
        tracing::warn!(parent: &self.span, %agent, %action, error = %error, "agent action failed");
        result.errors.push(AgentError {
            agent: agent.to_string(),
            action,
            error,
        });
    }

    /// Untracked or already stopped agents are left alone.
    async fn stop_agent(&self, name: &str) -> Result<()> {
        let info = match self.processes.process_info(name).await {
            Ok(info) => info,
            Err(SupervisorError::NotFound(_)) => {
                tracing::debug!(parent: &self.span, agent = %name, "agent not tracked, nothing to stop");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if !self.processes.is_running(info.pid).await {
            tracing::debug!(parent: &self.span, agent = %name, pid = info.pid, "agent already exited, dropping its record");
            return self.processes.forget(name).await;
        }

        self.processes.stop(info.pid).await?;
        tracing::info!(parent: &self.span, agent = %name, pid = info.pid, "agent stopped");
        Ok(())
    }

    async fn start_agent(&self, name: &str, agent: &AgentConfig, config: &Config) -> Result<()> {
        let (program, args) = agent
            .program_and_args()
            .ok_or_else(|| SupervisorError::EmptyCommand(name.to_string()))?;
        let env = self.agent_env(name, agent, config);

        let pid = self.processes.start(name, &program, &args, &env).await?;
        tracing::info!(parent: &self.span, agent = %name, pid, "agent started");
        Ok(())
    }

    /// Captured secrets plus the agent's identity. Identity keys take precedence.
    fn agent_env(&self, name: &str, agent: &AgentConfig, config: &Config) -> BTreeMap<String, String> {
        let mut env = self.secrets.clone();
        env.insert("AGENT_NAME".into(), name.to_string());
        env.insert("AGENT_MODEL".into(), agent.model.clone());
        env.insert("AGENT_PHASES".into(), agent.phases.join(","));
        env.insert("COORDINATOR_URL".into(), config.services.coordinator.url.clone());
        env.insert("TASK_STORE_PATH".into(), config.core.task_store.clone());
        env
    }
}

/// Runs a reconciliation for every configuration the watcher reloads
#[derive(Clone)]
pub struct ReconcileOnReload {
    engine: Arc<Mutex<ReconciliationEngine>>,
}

impl ReconcileOnReload {
    pub fn new(engine: Arc<Mutex<ReconciliationEngine>>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Mutex<ReconciliationEngine>> {
        &self.engine
    }
}

#[async_trait]
impl ReloadHandler for ReconcileOnReload {
    async fn on_reload(&self, config: &Config) -> asc_core::error::Result<()> {
        let mut engine = self.engine.lock().await;
        let result = engine.reload(config.clone()).await;

        if result.is_success() {
            return Ok(());
        }

        let failures: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        Err(AscError::Other(format!(
            "reconciliation finished with {} error(s): {}",
            failures.len(),
            failures.join("; ")
        )))
    }
}
