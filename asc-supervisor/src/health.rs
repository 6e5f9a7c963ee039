//! Agent health monitoring and automatic recovery
//!
//! [`HealthMonitor`] periodically compares the coordinator's view of each
//! configured agent with the process table. It reports three kinds of
//! problems:
//!
//! - crashed: the agent has no live process
//! - unresponsive: the process runs but its heartbeat went stale
//! - stuck: the agent has reported the same task for too long
//!
//! Crashed and unresponsive agents are restarted through the
//! [`ReconciliationEngine`] while holding its lock, so recovery never races a
//! configuration reload. Failed recoveries back off exponentially per agent.
//! Stuck agents are only reported.

use crate::reconcile::ReconciliationEngine;
use asc_core::liveness::{AgentState, AgentStatus, CoordinatorClient};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// Number of recovery actions kept in the history
pub const RECOVERY_HISTORY: usize = 100;

/// Longest wait between recovery attempts for one agent
const MAX_BACKOFF_MINUTES: i64 = 15;

/// Source of agent statuses
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Every agent with a heartbeat, marked offline past `offline_threshold`
    async fn agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> asc_core::error::Result<Vec<AgentStatus>>;
}

#[async_trait]
impl StatusSource for CoordinatorClient {
    async fn agent_statuses(
        &self,
        offline_threshold: Duration,
    ) -> asc_core::error::Result<Vec<AgentStatus>> {
        self.get_all_agent_statuses(offline_threshold).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthIssueKind {
    Crashed,
    Unresponsive,
    Stuck,
}

impl fmt::Display for HealthIssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthIssueKind::Crashed => write!(f, "crashed"),
            HealthIssueKind::Unresponsive => write!(f, "unresponsive"),
            HealthIssueKind::Stuck => write!(f, "stuck"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSeverity {
    Warning,
    Critical,
}

/// A problem found with one agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthIssue {
    pub agent: String,
    pub kind: HealthIssueKind,
    pub severity: HealthSeverity,
    pub description: String,
    pub detected_at: DateTime<Utc>,
}

/// One automatic recovery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryAction {
    pub agent: String,
    pub reason: HealthIssueKind,
    pub at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
}

/// Recovery bookkeeping for one agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub attempts: u32,
    pub successes: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// No recovery is attempted before this instant
    pub backoff_until: Option<DateTime<Utc>>,
}

impl RecoveryStats {
    /// Fraction of attempts that succeeded, zero before the first attempt
    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        f64::from(self.successes) / f64::from(self.attempts)
    }

    fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.backoff_until.is_some_and(|until| now < until)
    }

    /// Success clears the backoff; each failure doubles it from one minute
    /// up to fifteen.
    fn record(&mut self, success: bool, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_attempt = Some(now);

        if success {
            self.successes += 1;
            self.backoff_until = None;
        } else {
            let failures = self.attempts - self.successes;
            let minutes = (1i64 << (failures - 1).min(4)).min(MAX_BACKOFF_MINUTES);
            self.backoff_until = Some(now + chrono::Duration::minutes(minutes));
        }
    }
}

/// Last observation of one agent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentHealth {
    pub process_running: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub current_task: Option<String>,
    pub task_started: Option<DateTime<Utc>>,
    pub last_restart: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between checks
    pub check_interval: Duration,
    /// Heartbeat age after which a running agent is unresponsive
    pub unresponsive_timeout: Duration,
    /// Time on a single task after which an agent is stuck
    pub stuck_task_timeout: Duration,
    pub auto_recovery: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            unresponsive_timeout: Duration::from_secs(120),
            stuck_task_timeout: Duration::from_secs(30 * 60),
            auto_recovery: true,
        }
    }
}

#[derive(Default)]
struct MonitorState {
    agents: HashMap<String, AgentHealth>,
    issues: Vec<HealthIssue>,
    actions: Vec<RecoveryAction>,
    stats: HashMap<String, RecoveryStats>,
    auto_recovery: bool,
}

/// Watches agent health and restarts crashed or unresponsive agents
pub struct HealthMonitor {
    engine: Arc<Mutex<ReconciliationEngine>>,
    statuses: Arc<dyn StatusSource>,
    config: HealthConfig,
    state: StdMutex<MonitorState>,
    task: StdMutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    span: Span,
}

impl HealthMonitor {
    pub fn new(
        engine: Arc<Mutex<ReconciliationEngine>>,
        statuses: Arc<dyn StatusSource>,
        config: HealthConfig,
    ) -> Self {
        let state = MonitorState {
            auto_recovery: config.auto_recovery,
            ..Default::default()
        };
        Self {
            engine,
            statuses,
            config,
            state: StdMutex::new(state),
            task: StdMutex::new(None),
            cancel: CancellationToken::new(),
            span: tracing::info_span!("health_monitor"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Run a check now and then every `check_interval` until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>) {
        let Ok(mut slot) = self.task.lock() else {
            return;
        };
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let monitor = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                monitor.check().await;
            }
        }));
        tracing::info!(parent: &self.span, "health monitor started");
    }

    /// Stop the background loop. Later calls do nothing.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(parent: &self.span, error = %e, "health loop ended abnormally");
            }
            tracing::info!(parent: &self.span, "health monitor stopped");
        }
    }

    /// Check every configured agent once and recover what can be recovered.
    pub async fn check(&self) -> Vec<HealthIssue> {
        self.check_at(Utc::now()).await
    }

    pub(crate) async fn check_at(&self, now: DateTime<Utc>) -> Vec<HealthIssue> {
        let statuses = match self
            .statuses
            .agent_statuses(self.config.unresponsive_timeout)
            .await
        {
            Ok(statuses) => statuses,
            Err(e) => {
                tracing::warn!(parent: &self.span, error = %e, "cannot fetch agent statuses, skipping health check");
                return self.issues();
            }
        };
        let by_name: HashMap<&str, &AgentStatus> =
            statuses.iter().map(|s| (s.name.as_str(), s)).collect();

        // Held until recovery is done so a reload cannot interleave
        let engine = self.engine.lock().await;

        let mut running = HashMap::new();
        for name in engine.current().agents.keys() {
            running.insert(name.clone(), engine.is_agent_running(name).await);
        }

        let issues = {
            let Ok(mut state) = self.state.lock() else {
                return Vec::new();
            };
            state.agents.retain(|name, _| running.contains_key(name));

            let mut issues = Vec::new();
            for (name, is_running) in &running {
                let health = state.agents.entry(name.clone()).or_default();
                if let Some(issue) = self.assess(
                    name,
                    health,
                    *is_running,
                    by_name.get(name.as_str()).copied(),
                    now,
                ) {
                    issues.push(issue);
                }
            }
            issues.sort_by(|a, b| a.agent.cmp(&b.agent));
            state.issues = issues.clone();
            issues
        };

        if issues.is_empty() {
            tracing::debug!(parent: &self.span, "all agents healthy");
            return issues;
        }
        tracing::warn!(parent: &self.span, issues = issues.len(), "health check found problems");

        if self.is_auto_recovery_enabled() {
            for issue in &issues {
                self.recover(&engine, issue, now).await;
            }
        }
        issues
    }

    fn assess(
        &self,
        name: &str,
        health: &mut AgentHealth,
        is_running: bool,
        status: Option<&AgentStatus>,
        now: DateTime<Utc>,
    ) -> Option<HealthIssue> {
        health.process_running = is_running;
        health.last_check = Some(now);

        if !is_running {
            tracing::error!(parent: &self.span, agent = %name, "agent process is not running");
            return Some(issue(
                name,
                HealthIssueKind::Crashed,
                HealthSeverity::Critical,
                "Process has exited unexpectedly".into(),
                now,
            ));
        }

        let timeout = self.config.unresponsive_timeout;
        // A freshly restarted agent gets a full timeout to report in
        let in_grace = health
            .last_restart
            .is_some_and(|at| elapsed(now, at) <= timeout);

        let Some(status) = status else {
            let silent = health.last_heartbeat.map(|at| elapsed(now, at));
            return match silent {
                Some(silent) if silent > timeout && !in_grace => Some(issue(
                    name,
                    HealthIssueKind::Unresponsive,
                    HealthSeverity::Critical,
                    format!("No heartbeat data available for {}s", silent.as_secs()),
                    now,
                )),
                _ => None,
            };
        };

        if status.last_seen.is_some() {
            health.last_heartbeat = status.last_seen;
        }
        let silent = health.last_heartbeat.map(|at| elapsed(now, at));
        if !in_grace
            && (status.state == AgentState::Offline || silent.is_some_and(|s| s > timeout))
        {
            return Some(issue(
                name,
                HealthIssueKind::Unresponsive,
                HealthSeverity::Critical,
                format!("No heartbeat for {}s", silent.unwrap_or_default().as_secs()),
                now,
            ));
        }

        match (&status.state, &status.current_task) {
            (AgentState::Working, Some(task)) => {
                if health.current_task.as_deref() != Some(task.as_str()) {
                    health.current_task = Some(task.clone());
                    health.task_started = Some(now);
                    return None;
                }
                let busy = health.task_started.map(|at| elapsed(now, at))?;
                (busy > self.config.stuck_task_timeout).then(|| {
                    issue(
                        name,
                        HealthIssueKind::Stuck,
                        HealthSeverity::Warning,
                        format!("Working on task {task} for {}m", busy.as_secs() / 60),
                        now,
                    )
                })
            }
            _ => {
                health.current_task = None;
                health.task_started = None;
                None
            }
        }
    }

    async fn recover(&self, engine: &ReconciliationEngine, issue: &HealthIssue, now: DateTime<Utc>) {
        if issue.kind == HealthIssueKind::Stuck {
            return;
        }

        let backing_off = self
            .state
            .lock()
            .map(|state| state.stats.get(&issue.agent).is_some_and(|s| s.in_backoff(now)))
            .unwrap_or(true);
        if backing_off {
            tracing::debug!(parent: &self.span, agent = %issue.agent, "recovery in backoff, skipping");
            return;
        }

        tracing::info!(parent: &self.span, agent = %issue.agent, reason = %issue.kind, "restarting agent");
        let outcome = engine.restart_agent(&issue.agent).await;
        match &outcome {
            Ok(()) => tracing::info!(parent: &self.span, agent = %issue.agent, "agent recovered"),
            Err(e) => {
                tracing::error!(parent: &self.span, agent = %issue.agent, error = %e, "recovery failed")
            }
        }

        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let success = outcome.is_ok();
        state
            .stats
            .entry(issue.agent.clone())
            .or_default()
            .record(success, now);
        if success {
            if let Some(health) = state.agents.get_mut(&issue.agent) {
                health.last_restart = Some(now);
            }
        }
        state.actions.push(RecoveryAction {
            agent: issue.agent.clone(),
            reason: issue.kind,
            at: now,
            success,
            error: outcome.err().map(|e| e.to_string()),
        });
        let excess = state.actions.len().saturating_sub(RECOVERY_HISTORY);
        state.actions.drain(..excess);
    }

    /// Issues found by the latest completed check
    pub fn issues(&self) -> Vec<HealthIssue> {
        self.state.lock().map(|s| s.issues.clone()).unwrap_or_default()
    }

    /// `false` while any critical issue is outstanding
    pub fn is_healthy(&self) -> bool {
        self.issues()
            .iter()
            .all(|i| i.severity != HealthSeverity::Critical)
    }

    pub fn summary(&self) -> String {
        let issues = self.issues();
        if issues.is_empty() {
            return "All agents healthy".to_string();
        }
        let critical = issues
            .iter()
            .filter(|i| i.severity == HealthSeverity::Critical)
            .count();
        format!("{critical} critical, {} warning", issues.len() - critical)
    }

    pub fn agent_health(&self, name: &str) -> Option<AgentHealth> {
        self.state.lock().ok()?.agents.get(name).cloned()
    }

    /// Most recent recovery attempts, oldest first
    pub fn recovery_actions(&self) -> Vec<RecoveryAction> {
        self.state.lock().map(|s| s.actions.clone()).unwrap_or_default()
    }

    pub fn recovery_stats(&self, name: &str) -> Option<RecoveryStats> {
        self.state.lock().ok()?.stats.get(name).cloned()
    }

    pub fn set_auto_recovery(&self, enabled: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.auto_recovery = enabled;
        }
        tracing::info!(parent: &self.span, enabled, "auto-recovery toggled");
    }

    pub fn is_auto_recovery_enabled(&self) -> bool {
        self.state.lock().map(|s| s.auto_recovery).unwrap_or(false)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn issue(
    agent: &str,
    kind: HealthIssueKind,
    severity: HealthSeverity,
    description: String,
    detected_at: DateTime<Utc>,
) -> HealthIssue {
    HealthIssue {
        agent: agent.to_string(),
        kind,
        severity,
        description,
        detected_at,
    }
}

/// Time from `earlier` to `now`, zero if `earlier` lies in the future
fn elapsed(now: DateTime<Utc>, earlier: DateTime<Utc>) -> Duration {
    (now - earlier).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_fifteen_minutes() {
        let now = Utc::now();
        let mut stats = RecoveryStats::default();
        let mut waits = Vec::new();
        for _ in 0..6 {
            stats.record(false, now);
            waits.push((stats.backoff_until.unwrap() - now).num_minutes());
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 15, 15]);

        stats.record(true, now);
        assert!(stats.backoff_until.is_none());
        assert!(!stats.in_backoff(now));
        assert_eq!(stats.attempts, 7);
        assert!((stats.success_rate() - 1.0 / 7.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_elapsed_clamps_future() {
        let now = Utc::now();
        assert_eq!(elapsed(now, now + chrono::Duration::seconds(5)), Duration::ZERO);
        assert_eq!(elapsed(now, now - chrono::Duration::seconds(5)), Duration::from_secs(5));
    }
}
