//! Engine and health monitor tests against a recording process controller

use crate::{
    AgentAction, COORDINATOR_PROCESS, HealthConfig, HealthIssueKind, HealthMonitor,
    HealthSeverity, ProcessControl, ReconcileOnReload, ReconciliationEngine, StatusSource,
    SupervisorError, diff,
};
use asc_core::config::{AgentConfig, Config, ReloadHandler};
use asc_core::error::AscError;
use asc_core::liveness::{AgentState, AgentStatus};
use asc_core::state::ProcessRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Start {
        name: String,
        program: String,
        args: Vec<String>,
        env: BTreeMap<String, String>,
    },
    Stop(u32),
    Forget(String),
}

#[derive(Default)]
struct MockState {
    next_pid: u32,
    /// Name to pid of every tracked process, dead or alive
    records: HashMap<String, u32>,
    alive: HashSet<u32>,
    calls: Vec<Call>,
    fail_start: HashSet<String>,
    fail_stop: HashSet<String>,
}

// Mock process controller for testing
#[derive(Default)]
struct MockProcessControl {
    state: Mutex<MockState>,
}

impl MockProcessControl {
    fn failing_start(names: &[&str]) -> Self {
        let mock = Self::default();
        mock.state.lock().unwrap().fail_start = names.iter().map(|s| s.to_string()).collect();
        mock
    }

    fn fail_stop(&self, name: &str) {
        self.state.lock().unwrap().fail_stop.insert(name.to_string());
    }

    fn fail_start(&self, name: &str, fail: bool) {
        let mut state = self.state.lock().unwrap();
        if fail {
            state.fail_start.insert(name.to_string());
        } else {
            state.fail_start.remove(name);
        }
    }

    /// The process exits on its own; its record stays behind.
    fn crash(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(pid) = state.records.get(name).copied() {
            state.alive.remove(&pid);
        }
    }

    fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Pid of a live process started for `name`
    fn pid_of(&self, name: &str) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.records.get(name).copied().filter(|pid| state.alive.contains(pid))
    }

    fn is_tracked(&self, name: &str) -> bool {
        self.state.lock().unwrap().records.contains_key(name)
    }

    fn starts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Start { name, .. } => Some(name),
                _ => None,
            })
            .collect()
    }

    fn stops(&self) -> usize {
        self.calls().iter().filter(|c| matches!(c, Call::Stop(_))).count()
    }
}

#[async_trait]
impl ProcessControl for MockProcessControl {
    async fn start(
        &self,
        name: &str,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> crate::Result<u32> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Start {
            name: name.to_string(),
            program: program.to_string(),
            args: args.to_vec(),
            env: env.clone(),
        });
        if state.fail_start.contains(name) {
            return Err(SupervisorError::Process(format!("spawn failed for {name}")));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.records.insert(name.to_string(), pid);
        state.alive.insert(pid);
        Ok(pid)
    }

    async fn stop(&self, pid: u32) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Stop(pid));
        let name = state
            .records
            .iter()
            .find(|(_, p)| **p == pid)
            .map(|(n, _)| n.clone());
        if let Some(name) = name {
            if state.fail_stop.contains(&name) {
                return Err(SupervisorError::Process(format!("{name} ignored SIGTERM")));
            }
            state.records.remove(&name);
        }
        state.alive.remove(&pid);
        Ok(())
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.state.lock().unwrap().alive.contains(&pid)
    }

    async fn process_info(&self, name: &str) -> crate::Result<ProcessRecord> {
        let state = self.state.lock().unwrap();
        let pid = state
            .records
            .get(name)
            .copied()
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
        Ok(ProcessRecord {
            name: name.to_string(),
            pid,
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            started_at: Utc::now(),
            log_file: Default::default(),
        })
    }

    async fn forget(&self, name: &str) -> crate::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Forget(name.to_string()));
        state.records.remove(name);
        Ok(())
    }
}

fn agent(command: &str, model: &str, phases: &[&str]) -> AgentConfig {
    AgentConfig {
        command: command.to_string(),
        model: model.to_string(),
        phases: phases.iter().map(|p| p.to_string()).collect(),
    }
}

fn config(agents: &[(&str, AgentConfig)]) -> Config {
    let mut config = Config::default();
    config.core.task_store = "/srv/tasks".to_string();
    config.services.coordinator.url = "http://localhost:8765".to_string();
    config.agents = agents
        .iter()
        .map(|(name, agent)| (name.to_string(), agent.clone()))
        .collect();
    config
}

fn engine(initial: Config, processes: Arc<MockProcessControl>) -> ReconciliationEngine {
    let secrets = BTreeMap::from([("CLAUDE_API_KEY".to_string(), "sk-test".to_string())]);
    ReconciliationEngine::new(initial, processes, secrets).with_span(tracing::Span::none())
}

fn names(items: &[&str]) -> std::collections::BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn test_add_and_update_issue_minimal_actions() {
    let processes = Arc::new(MockProcessControl::default());
    let initial = config(&[("p", agent("python agent.py", "claude", &["planning"]))]);
    let mut engine = engine(initial, processes.clone());

    let started = engine.start_all().await;
    assert_eq!(started.added, names(&["p"]));
    let old_pid = processes.pid_of("p").unwrap();
    processes.clear_calls();

    let next = config(&[
        ("p", agent("python agent.py", "gemini", &["planning"])),
        ("q", agent("python agent.py --fast", "claude", &["testing"])),
    ]);
    let result = engine.reload(next.clone()).await;

    assert_eq!(result.added, names(&["q"]));
    assert_eq!(result.updated, names(&["p"]));
    assert!(result.removed.is_empty());
    assert!(result.is_success());

    assert_eq!(processes.stops(), 1);
    assert_eq!(processes.calls()[0], Call::Stop(old_pid));
    assert_eq!(processes.starts(), vec!["p", "q"]);
    assert_eq!(engine.current(), &next);
}

#[tokio::test]
async fn test_start_environment() {
    let processes = Arc::new(MockProcessControl::default());
    let mut engine = engine(Config::default(), processes.clone());

    let mut next = config(&[("coder", agent("python agent.py --verbose", "claude", &["design", "testing"]))]);
    next.agents.insert("sneaky".into(), agent("run", "codex", &["review"]));
    engine.reload(next).await;

    let Call::Start { name, program, args, env } = processes.calls().remove(0) else {
        panic!("expected a start");
    };
    assert_eq!(name, "coder");
    assert_eq!(program, "python");
    assert_eq!(args, vec!["agent.py", "--verbose"]);
    assert_eq!(env["AGENT_NAME"], "coder");
    assert_eq!(env["AGENT_MODEL"], "claude");
    assert_eq!(env["AGENT_PHASES"], "design,testing");
    assert_eq!(env["COORDINATOR_URL"], "http://localhost:8765");
    assert_eq!(env["TASK_STORE_PATH"], "/srv/tasks");
    assert_eq!(env["CLAUDE_API_KEY"], "sk-test");
}

#[tokio::test]
async fn test_identity_keys_win_over_secrets() {
    let processes = Arc::new(MockProcessControl::default());
    let secrets = BTreeMap::from([("AGENT_NAME".to_string(), "impostor".to_string())]);
    let mut engine = ReconciliationEngine::new(Config::default(), processes.clone(), secrets);

    engine.reload(config(&[("real", agent("run", "claude", &["review"]))])).await;

    let Call::Start { env, .. } = processes.calls().remove(0) else {
        panic!("expected a start");
    };
    assert_eq!(env["AGENT_NAME"], "real");
}

#[test]
fn test_phase_reorder_is_not_an_update() {
    let old = config(&[("a", agent("run", "claude", &["planning", "design", "testing"]))]);
    let new = config(&[("a", agent("run", "claude", &["testing", "planning", "design"]))]);

    let result = diff(&old, &new);
    assert!(!result.has_changes());
}

#[test]
fn test_phase_membership_changes_are_updates() {
    let base = agent("run", "claude", &["planning", "design"]);
    let old = config(&[("a", base.clone())]);

    let variants = [
        agent("run", "claude", &["planning", "design", "testing"]),
        agent("run", "claude", &["planning"]),
        agent("run", "claude", &["planning", "review"]),
        agent("run", "claude", &["planning", "planning"]),
        agent("run", "claude", &["planning", "design", "design"]),
        agent("run --flag", "claude", &["planning", "design"]),
        agent("run", "codex", &["planning", "design"]),
    ];
    for variant in variants {
        let result = diff(&old, &config(&[("a", variant.clone())]));
        assert_eq!(result.updated, names(&["a"]), "{variant:?} should be an update");
    }
}

#[test]
fn test_result_sets_are_disjoint() {
    let fleets = [
        config(&[]),
        config(&[("a", agent("run", "claude", &["planning"]))]),
        config(&[
            ("a", agent("run", "gemini", &["planning"])),
            ("b", agent("run", "claude", &["testing"])),
        ]),
        config(&[
            ("b", agent("run", "claude", &["testing"])),
            ("c", agent("go", "codex", &["review", "design"])),
        ]),
        config(&[
            ("a", agent("run", "claude", &["planning"])),
            ("c", agent("go", "codex", &["design", "review"])),
            ("d", agent("go", "openai", &["debugging"])),
        ]),
    ];

    for old in &fleets {
        for new in &fleets {
            let result = diff(old, new);
            assert!(result.added.is_disjoint(&result.removed));
            assert!(result.added.is_disjoint(&result.updated));
            assert!(result.removed.is_disjoint(&result.updated));

            let known: HashSet<&String> = old.agents.keys().chain(new.agents.keys()).collect();
            for name in result.added.iter().chain(&result.removed).chain(&result.updated) {
                assert!(known.contains(name));
            }
        }
    }
}

#[tokio::test]
async fn test_removed_agents_are_stopped() {
    let processes = Arc::new(MockProcessControl::default());
    let initial = config(&[
        ("keep", agent("run", "claude", &["planning"])),
        ("drop", agent("run", "claude", &["testing"])),
    ]);
    let mut engine = engine(initial, processes.clone());
    engine.start_all().await;
    let dropped = processes.pid_of("drop").unwrap();
    processes.clear_calls();

    let result = engine
        .reload(config(&[("keep", agent("run", "claude", &["planning"]))]))
        .await;

    assert_eq!(result.removed, names(&["drop"]));
    assert_eq!(processes.calls(), vec![Call::Stop(dropped)]);
    assert!(processes.pid_of("keep").is_some());
}

#[tokio::test]
async fn test_stopping_untracked_agent_is_noop() {
    let processes = Arc::new(MockProcessControl::default());
    // Never started, so the controller has no record of it
    let initial = config(&[("ghost", agent("run", "claude", &["planning"]))]);
    let mut engine = engine(initial, processes.clone());

    let result = engine.reload(config(&[])).await;
    assert_eq!(result.removed, names(&["ghost"]));
    assert!(result.is_success());
    assert!(processes.calls().is_empty());
}

#[tokio::test]
async fn test_empty_command_fails_only_that_agent() {
    let processes = Arc::new(MockProcessControl::default());
    let mut engine = engine(Config::default(), processes.clone());

    let result = engine
        .reload(config(&[
            ("blank", agent("   ", "claude", &["planning"])),
            ("fine", agent("run", "claude", &["testing"])),
        ]))
        .await;

    assert_eq!(result.added, names(&["blank", "fine"]));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].agent, "blank");
    assert!(matches!(result.errors[0].error, SupervisorError::EmptyCommand(_)));
    assert_eq!(processes.starts(), vec!["fine"]);
}

#[tokio::test]
async fn test_partial_failure_converges_the_rest() {
    let processes = Arc::new(MockProcessControl::failing_start(&["b"]));
    let mut engine = engine(Config::default(), processes.clone());

    let target = config(&[
        ("a", agent("run", "claude", &["planning"])),
        ("b", agent("run", "claude", &["design"])),
        ("c", agent("run", "claude", &["testing"])),
    ]);
    let result = engine.reload(target.clone()).await;

    assert_eq!(result.added, names(&["a", "b", "c"]));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].agent, "b");
    assert_eq!(result.errors[0].action, AgentAction::Start);
    assert!(result.errors[0].to_string().contains("failed to start agent b"));
    assert!(processes.pid_of("a").is_some());
    assert!(processes.pid_of("c").is_some());

    // Target is adopted anyway; the failed start is not retried
    assert_eq!(engine.current(), &target);
    processes.clear_calls();
    let again = engine.reload(target).await;
    assert!(!again.has_changes());
    assert!(processes.calls().is_empty());
}

#[tokio::test]
async fn test_update_with_failed_stop_is_not_restarted() {
    let processes = Arc::new(MockProcessControl::default());
    let initial = config(&[("stuck", agent("run", "claude", &["planning"]))]);
    let mut engine = engine(initial, processes.clone());
    engine.start_all().await;
    processes.fail_stop("stuck");
    processes.clear_calls();

    let result = engine
        .reload(config(&[("stuck", agent("run", "gemini", &["planning"]))]))
        .await;

    assert_eq!(result.updated, names(&["stuck"]));
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].action, AgentAction::Stop);
    assert!(processes.starts().is_empty());
}

#[tokio::test]
async fn test_reload_handler_reports_failures() {
    let processes = Arc::new(MockProcessControl::failing_start(&["broken"]));
    let engine = engine(Config::default(), processes.clone());
    let handler = ReconcileOnReload::new(Arc::new(tokio::sync::Mutex::new(engine)));

    handler
        .on_reload(&config(&[("ok", agent("run", "claude", &["planning"]))]))
        .await
        .unwrap();

    let err = handler
        .on_reload(&config(&[
            ("ok", agent("run", "claude", &["planning"])),
            ("broken", agent("run", "claude", &["testing"])),
        ]))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 error(s)"));
    assert!(err.to_string().contains("broken"));

    let engine = handler.engine().lock().await;
    assert!(engine.current().agents.contains_key("broken"));
}

#[tokio::test]
async fn test_stopping_exited_agent_drops_its_record() {
    let processes = Arc::new(MockProcessControl::default());
    let initial = config(&[
        ("keep", agent("run", "claude", &["planning"])),
        ("gone", agent("run", "claude", &["testing"])),
    ]);
    let mut engine = engine(initial, processes.clone());
    engine.start_all().await;
    processes.crash("gone");
    processes.clear_calls();

    let result = engine
        .reload(config(&[("keep", agent("run", "claude", &["planning"]))]))
        .await;

    assert!(result.is_success());
    assert_eq!(processes.calls(), vec![Call::Forget("gone".into())]);
    assert!(!processes.is_tracked("gone"));
}

#[tokio::test]
async fn test_stop_all_leaves_configuration() {
    let processes = Arc::new(MockProcessControl::default());
    let initial = config(&[
        ("a", agent("run", "claude", &["planning"])),
        ("b", agent("run", "claude", &["testing"])),
    ]);
    let engine = engine(initial.clone(), processes.clone());
    engine.start_all().await;
    processes.crash("b");

    let result = engine.stop_all().await;
    assert_eq!(result.removed, names(&["a", "b"]));
    assert!(result.is_success());
    assert_eq!(processes.stops(), 1);
    assert!(!processes.is_tracked("a"));
    assert!(!processes.is_tracked("b"));
    assert_eq!(engine.current(), &initial);
}

#[tokio::test]
async fn test_restart_agent() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    let first = processes.pid_of("a").unwrap();

    engine.restart_agent("a").await.unwrap();
    let second = processes.pid_of("a").unwrap();
    assert_ne!(first, second);
    assert!(engine.is_agent_running("a").await);

    assert!(matches!(
        engine.restart_agent("missing").await,
        Err(SupervisorError::NotFound(_))
    ));
    assert!(!engine.is_agent_running("missing").await);
}

#[tokio::test]
async fn test_coordinator_lifecycle() {
    let processes = Arc::new(MockProcessControl::default());
    let mut fleet = config(&[("a", agent("run", "claude", &["planning"]))]);
    fleet.services.coordinator.start_command = "python -m coordinator.server".into();
    let engine = engine(fleet, processes.clone());

    let pid = engine.start_coordinator().await.unwrap();
    let Call::Start { name, program, args, env } = processes.calls().remove(0) else {
        panic!("expected a start");
    };
    assert_eq!(name, COORDINATOR_PROCESS);
    assert_eq!(program, "python");
    assert_eq!(args, vec!["-m", "coordinator.server"]);
    assert_eq!(env["CLAUDE_API_KEY"], "sk-test");
    assert!(!env.contains_key("AGENT_NAME"));

    engine.stop_coordinator().await.unwrap();
    assert_eq!(processes.calls().last(), Some(&Call::Stop(pid)));
    // Already stopped
    engine.stop_coordinator().await.unwrap();
}

#[tokio::test]
async fn test_blank_coordinator_command() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[]), processes.clone());
    assert!(matches!(
        engine.start_coordinator().await,
        Err(SupervisorError::EmptyCommand(_))
    ));
    assert!(processes.calls().is_empty());
}

/// Statuses served to the health monitor
#[derive(Default)]
struct FakeStatuses {
    statuses: Mutex<Vec<AgentStatus>>,
    unavailable: AtomicBool,
}

impl FakeStatuses {
    fn set(&self, statuses: Vec<AgentStatus>) {
        *self.statuses.lock().unwrap() = statuses;
    }
}

#[async_trait]
impl StatusSource for FakeStatuses {
    async fn agent_statuses(
        &self,
        _offline_threshold: Duration,
    ) -> asc_core::error::Result<Vec<AgentStatus>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AscError::Other("coordinator down".into()));
        }
        Ok(self.statuses.lock().unwrap().clone())
    }
}

fn status(name: &str, state: AgentState, task: Option<&str>, last_seen: DateTime<Utc>) -> AgentStatus {
    AgentStatus {
        name: name.to_string(),
        state,
        current_task: task.map(str::to_string),
        last_seen: Some(last_seen),
    }
}

fn monitor(engine: ReconciliationEngine, statuses: Arc<FakeStatuses>) -> HealthMonitor {
    HealthMonitor::new(
        Arc::new(tokio::sync::Mutex::new(engine)),
        statuses,
        HealthConfig::default(),
    )
    .with_span(tracing::Span::none())
}

fn secs(n: i64) -> chrono::Duration {
    chrono::Duration::seconds(n)
}

#[tokio::test]
async fn test_crashed_agent_is_restarted() {
    let processes = Arc::new(MockProcessControl::default());
    let fleet = config(&[
        ("a", agent("run", "claude", &["planning"])),
        ("b", agent("run", "claude", &["testing"])),
    ]);
    let engine = engine(fleet, processes.clone());
    engine.start_all().await;
    processes.crash("a");
    processes.clear_calls();

    let monitor = monitor(engine, Arc::new(FakeStatuses::default()));
    let now = Utc::now();
    let issues = monitor.check_at(now).await;

    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].agent, "a");
    assert_eq!(issues[0].kind, HealthIssueKind::Crashed);
    assert_eq!(issues[0].severity, HealthSeverity::Critical);
    assert_eq!(processes.starts(), vec!["a"]);
    assert!(processes.pid_of("a").is_some());

    let actions = monitor.recovery_actions();
    assert_eq!(actions.len(), 1);
    assert!(actions[0].success);
    let stats = monitor.recovery_stats("a").unwrap();
    assert_eq!((stats.attempts, stats.successes), (1, 1));

    assert!(monitor.check_at(now + secs(30)).await.is_empty());
    assert_eq!(monitor.summary(), "All agents healthy");
}

#[tokio::test]
async fn test_failed_start_is_recovered_later() {
    let processes = Arc::new(MockProcessControl::failing_start(&["b"]));
    let mut engine = engine(Config::default(), processes.clone());
    let result = engine
        .reload(config(&[
            ("a", agent("run", "claude", &["planning"])),
            ("b", agent("run", "claude", &["testing"])),
        ]))
        .await;
    assert_eq!(result.errors.len(), 1);

    processes.fail_start("b", false);
    let monitor = monitor(engine, Arc::new(FakeStatuses::default()));
    let issues = monitor.check_at(Utc::now()).await;

    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].agent, "b");
    assert!(processes.pid_of("b").is_some());
}

#[tokio::test]
async fn test_failed_recovery_backs_off() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    processes.fail_start("a", true);
    processes.crash("a");
    processes.clear_calls();

    let monitor = monitor(engine, Arc::new(FakeStatuses::default()));
    let now = Utc::now();

    monitor.check_at(now).await;
    assert_eq!(processes.starts().len(), 1);
    let stats = monitor.recovery_stats("a").unwrap();
    assert_eq!(stats.backoff_until, Some(now + secs(60)));
    assert!(!monitor.recovery_actions()[0].success);

    // Still crashed, but inside the one minute backoff
    let issues = monitor.check_at(now + secs(30)).await;
    assert_eq!(issues[0].kind, HealthIssueKind::Crashed);
    assert_eq!(processes.starts().len(), 1);

    monitor.check_at(now + secs(61)).await;
    assert_eq!(processes.starts().len(), 2);
    let stats = monitor.recovery_stats("a").unwrap();
    assert_eq!(stats.backoff_until, Some(now + secs(61) + secs(120)));
    assert_eq!(stats.success_rate(), 0.0);
}

#[tokio::test]
async fn test_unresponsive_agent_restarted_then_given_grace() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    let old_pid = processes.pid_of("a").unwrap();
    processes.clear_calls();

    let now = Utc::now();
    let statuses = Arc::new(FakeStatuses::default());
    statuses.set(vec![status("a", AgentState::Offline, None, now - secs(600))]);
    let monitor = monitor(engine, statuses.clone());

    let issues = monitor.check_at(now).await;
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, HealthIssueKind::Unresponsive);
    assert_eq!(processes.calls()[0], Call::Stop(old_pid));
    assert_eq!(processes.starts(), vec!["a"]);

    // The restarted agent has not reported yet
    assert!(monitor.check_at(now + secs(30)).await.is_empty());

    let issues = monitor.check_at(now + secs(180)).await;
    assert_eq!(issues[0].kind, HealthIssueKind::Unresponsive);
    assert_eq!(processes.starts().len(), 2);
}

#[tokio::test]
async fn test_stuck_agent_reported_not_restarted() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    processes.clear_calls();

    let now = Utc::now();
    let statuses = Arc::new(FakeStatuses::default());
    statuses.set(vec![status("a", AgentState::Working, Some("task-7"), now)]);
    let monitor = monitor(engine, statuses.clone());
    assert!(monitor.check_at(now).await.is_empty());

    let later = now + secs(31 * 60);
    statuses.set(vec![status("a", AgentState::Working, Some("task-7"), later)]);
    let issues = monitor.check_at(later).await;

    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].kind, HealthIssueKind::Stuck);
    assert_eq!(issues[0].severity, HealthSeverity::Warning);
    assert!(monitor.is_healthy());
    assert_eq!(monitor.summary(), "0 critical, 1 warning");
    assert!(processes.calls().is_empty());

    // A new task resets the clock
    statuses.set(vec![status("a", AgentState::Working, Some("task-8"), later)]);
    assert!(monitor.check_at(later + secs(60)).await.is_empty());
    let health = monitor.agent_health("a").unwrap();
    assert_eq!(health.current_task.as_deref(), Some("task-8"));
}

#[tokio::test]
async fn test_recovery_disabled_and_status_outage() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    processes.crash("a");
    processes.clear_calls();

    let statuses = Arc::new(FakeStatuses::default());
    let monitor = monitor(engine, statuses.clone());
    monitor.set_auto_recovery(false);
    assert!(!monitor.is_auto_recovery_enabled());

    let issues = monitor.check_at(Utc::now()).await;
    assert_eq!(issues.len(), 1);
    assert!(!monitor.is_healthy());
    assert_eq!(monitor.summary(), "1 critical, 0 warning");
    assert!(processes.calls().is_empty());

    // Previous findings stand while statuses are unavailable
    statuses.unavailable.store(true, Ordering::SeqCst);
    assert_eq!(monitor.check_at(Utc::now()).await, issues);
    assert!(processes.calls().is_empty());
}

#[tokio::test]
async fn test_monitor_follows_reloads() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("old", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;

    let shared = Arc::new(tokio::sync::Mutex::new(engine));
    let monitor = HealthMonitor::new(
        shared.clone(),
        Arc::new(FakeStatuses::default()),
        HealthConfig::default(),
    );
    monitor.check_at(Utc::now()).await;
    assert!(monitor.agent_health("old").is_some());

    let handler = ReconcileOnReload::new(shared);
    handler
        .on_reload(&config(&[("new", agent("run", "claude", &["testing"]))]))
        .await
        .unwrap();

    assert!(monitor.check_at(Utc::now()).await.is_empty());
    assert!(monitor.agent_health("old").is_none());
    assert!(monitor.agent_health("new").unwrap().process_running);
}

#[tokio::test]
async fn test_monitor_loop_recovers_and_stops() {
    let processes = Arc::new(MockProcessControl::default());
    let engine = engine(config(&[("a", agent("run", "claude", &["planning"]))]), processes.clone());
    engine.start_all().await;
    processes.crash("a");

    let monitor = Arc::new(monitor(engine, Arc::new(FakeStatuses::default())));
    monitor.start();

    tokio::time::timeout(Duration::from_secs(5), async {
        while processes.pid_of("a").is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent was not restarted");

    monitor.stop().await;
    monitor.stop().await;
}
