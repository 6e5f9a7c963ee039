//! Process-based supervisor implementation

use crate::{Result, SupervisorError};
use asc_core::diagnostics::{PidProbe, SignalProbe};
use asc_core::state::{ProcessRecord, StateLayout};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::Span;

/// Start, stop and inspect named OS processes
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Spawn `program` for agent `name` and return its pid
    async fn start(
        &self,
        name: &str,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<u32>;

    /// Stop a process by pid. Stopping a process that is already gone succeeds.
    async fn stop(&self, pid: u32) -> Result<()>;

    async fn is_running(&self, pid: u32) -> bool;

    /// Record of the process started for `name`, or [`SupervisorError::NotFound`]
    async fn process_info(&self, name: &str) -> Result<ProcessRecord>;

    /// Drop the record kept for `name`. Forgetting an untracked name succeeds.
    async fn forget(&self, name: &str) -> Result<()>;
}

/// Configuration for process supervisor
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Shutdown timeout before force kill
    pub shutdown_timeout: Duration,

    /// How often to check whether a stopping process has exited
    pub poll_interval: Duration,

    /// Working directory for agents
    pub working_dir: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            working_dir: None,
        }
    }
}

/// Supervises local child processes, one record per agent under `pids/`
pub struct LocalProcessSupervisor {
    layout: StateLayout,
    config: SupervisorConfig,
    probe: Arc<dyn PidProbe>,
    span: Span,
}

impl LocalProcessSupervisor {
    pub fn new(layout: StateLayout) -> Self {
        Self::with_config(layout, SupervisorConfig::default())
    }

    pub fn with_config(layout: StateLayout, config: SupervisorConfig) -> Self {
        Self {
            layout,
            config,
            probe: Arc::new(SignalProbe),
            span: tracing::info_span!("process_supervisor"),
        }
    }

    pub fn with_pid_probe(mut self, probe: Arc<dyn PidProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    /// Every readable process record. Unparsable records are skipped.
    pub fn list_processes(&self) -> Result<Vec<ProcessRecord>> {
        let pid_dir = self.layout.pid_dir();
        let entries = match std::fs::read_dir(&pid_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match ProcessRecord::read(&path) {
                Ok(record) => records.push(record),
                Err(e) => tracing::debug!(
                    parent: &self.span,
                    path = %path.display(),
                    error = %e,
                    "skipping unreadable process record"
                ),
            }
        }

        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Stop every recorded process that is still alive and remove all records.
    ///
    /// Returns the agents whose stop failed; the rest are still stopped.
    pub async fn stop_all(&self) -> Vec<(String, SupervisorError)> {
        let records = match self.list_processes() {
            Ok(records) => records,
            Err(e) => return vec![("*".to_string(), e)],
        };

        let mut errors = Vec::new();
        for record in records {
            if self.probe.is_alive(record.pid) {
                if let Err(e) = self.stop(record.pid).await {
                    tracing::warn!(
                        parent: &self.span,
                        agent = %record.name,
                        pid = record.pid,
                        error = %e,
                        "failed to stop process"
                    );
                    errors.push((record.name, e));
                    continue;
                }
            }
            if let Err(e) = self.remove_record(&record.name) {
                errors.push((record.name, e));
            }
        }
        errors
    }

    fn remove_record(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.layout.record_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the record of whichever agent owns `pid`.
    fn forget_pid(&self, pid: u32) {
        let Ok(records) = self.list_processes() else {
            return;
        };
        for record in records.into_iter().filter(|r| r.pid == pid) {
            if let Err(e) = self.remove_record(&record.name) {
                tracing::warn!(
                    parent: &self.span,
                    agent = %record.name,
                    error = %e,
                    "failed to remove process record"
                );
            }
        }
    }

    async fn wait_for_exit(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.probe.is_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl ProcessControl for LocalProcessSupervisor {
    async fn start(
        &self,
        name: &str,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<u32> {
        tracing::info!(parent: &self.span, agent = %name, %program, "starting process");

        // Check if already running
        if let Ok(existing) = ProcessRecord::read(self.layout.record_path(name)) {
            if self.probe.is_alive(existing.pid) {
                return Err(SupervisorError::Process(format!(
                    "agent {name} is already running (pid {})",
                    existing.pid
                )));
            }
        }

        self.layout.ensure()?;
        let log_file = self.layout.log_path(name);
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(ref working_dir) = self.config.working_dir {
            cmd.current_dir(working_dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| SupervisorError::Process(format!("failed to spawn {program}: {e}")))?;
        let Some(pid) = child.id() else {
            return Err(SupervisorError::Process(format!(
                "{program} exited before its pid could be read"
            )));
        };

        let record = ProcessRecord {
            name: name.to_string(),
            pid,
            command: program.to_string(),
            args: args.to_vec(),
            env: env.clone(),
            started_at: Utc::now(),
            log_file,
        };
        if let Err(e) = record.write(self.layout.record_path(name)) {
            // An untracked process could never be stopped again
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return Err(e.into());
        }

        // Reap the child so a finished agent does not linger as a zombie
        let span = self.span.clone();
        let agent = name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::info!(parent: &span, %agent, pid, %status, "process exited"),
                Err(e) => tracing::warn!(parent: &span, %agent, pid, error = %e, "failed to wait for process"),
            }
        });

        tracing::info!(parent: &self.span, agent = %name, pid, "process started");
        Ok(pid)
    }

    #[cfg(unix)]
    async fn stop(&self, pid: u32) -> Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 1 => raw,
            _ => return Err(SupervisorError::Process(format!("refusing to signal pid {pid}"))),
        };

        // Agents lead their own process group; signal the whole group
        let send = |sig: Signal| match signal::killpg(Pid::from_raw(raw), sig)
            .or_else(|_| signal::kill(Pid::from_raw(raw), sig))
        {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(SupervisorError::Process(format!("failed to send {sig:?} to {pid}: {e}"))),
        };

        tracing::info!(parent: &self.span, pid, "stopping process");
        send(Signal::SIGTERM)?;

        if !self.wait_for_exit(pid, self.config.shutdown_timeout).await {
            tracing::warn!(parent: &self.span, pid, "shutdown timeout, force killing");
            send(Signal::SIGKILL)?;
            self.wait_for_exit(pid, self.config.poll_interval * 10).await;
        }

        self.forget_pid(pid);
        Ok(())
    }

    #[cfg(not(unix))]
    async fn stop(&self, pid: u32) -> Result<()> {
        Err(SupervisorError::Process(format!(
            "cannot signal pid {pid} on this platform"
        )))
    }

    async fn is_running(&self, pid: u32) -> bool {
        self.probe.is_alive(pid)
    }

    async fn process_info(&self, name: &str) -> Result<ProcessRecord> {
        match ProcessRecord::read(self.layout.record_path(name)) {
            Ok(record) => Ok(record),
            Err(asc_core::error::AscError::Io(e)) if e.kind() == ErrorKind::NotFound => {
                Err(SupervisorError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn forget(&self, name: &str) -> Result<()> {
        self.remove_record(name)
    }
}
