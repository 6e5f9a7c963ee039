//! The six checkers. Each appends issues and skips checks whose
//! prerequisites are missing.

use super::{Diagnostics, Issue, IssueKind, Severity};
use crate::config::{Config, DEFAULT_COORDINATOR_URL, Model};
use crate::error::Result;
use crate::state::{ProcessRecord, StateSubdir};
use std::path::Path;

const MB: f64 = 1024.0 * 1024.0;

impl Diagnostics {
    pub(super) fn check_configuration(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let config_path = &self.config.config_path;

        if !config_path.exists() {
            issues.push(Issue::new(
                IssueKind::ConfigMissing,
                Severity::Critical,
                "Configuration file not found",
                format!("The configuration file '{}' does not exist", config_path.display()),
                "The fleet cannot start without a configuration file",
                "Run 'asc init' to create a default configuration file",
            ));
        } else if let Err(e) = Config::load(config_path) {
            issues.push(Issue::new(
                IssueKind::ConfigInvalid,
                Severity::Critical,
                "Invalid configuration",
                e.to_string(),
                "The configuration cannot be loaded",
                "Fix the reported error or run 'asc init --force' to regenerate",
            ));
        }

        let env_path = &self.config.env_path;
        if !env_path.exists() {
            issues.push(Issue::new(
                IssueKind::EnvMissing,
                Severity::High,
                "Environment file not found",
                format!("The .env file '{}' does not exist", env_path.display()),
                "API keys will not be loaded, agents cannot authenticate",
                "Create a .env file with the required API keys (CLAUDE_API_KEY, OPENAI_API_KEY, GOOGLE_API_KEY)",
            ));
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = std::fs::metadata(env_path)?.permissions().mode() & 0o777;
            if mode & 0o077 != 0 {
                issues.push(Issue::new(
                    IssueKind::EnvPermissions,
                    Severity::Medium,
                    "Insecure .env file permissions",
                    format!(".env file has permissions {mode:o} (should be 600)"),
                    "API keys may be readable by other users",
                    format!("Run 'chmod 600 {}'", env_path.display()),
                ));
            }
        }

        Ok(())
    }

    pub(super) fn check_state(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let layout = &self.config.layout;
        let pid_dir = layout.pid_dir();

        let entries = if pid_dir.is_dir() {
            match std::fs::read_dir(&pid_dir) {
                Ok(entries) => Some(entries),
                Err(e) => {
                    tracing::warn!(
                        parent: &self.span,
                        dir = %pid_dir.display(),
                        error = %e,
                        "cannot read process records, skipping record scan"
                    );
                    None
                }
            }
        } else {
            None
        };

        if let Some(entries) = entries {
            for entry in entries {
                let path = match entry {
                    Ok(entry) => entry.path(),
                    Err(_) => continue,
                };
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(file) = path.file_name().and_then(|f| f.to_str()).map(String::from)
                else {
                    continue;
                };
                let Ok(content) = std::fs::read(&path) else {
                    continue;
                };

                match serde_json::from_slice::<ProcessRecord>(&content) {
                    Err(e) => issues.push(Issue::new(
                        IssueKind::CorruptedRecord { file: file.clone() },
                        Severity::Medium,
                        "Corrupted process record",
                        format!("Process record '{file}' cannot be parsed: {e}"),
                        "The process cannot be tracked",
                        format!("Delete the corrupted file: rm {}", path.display()),
                    )),
                    Ok(record) if !self.pid_probe.is_alive(record.pid) => {
                        issues.push(Issue::new(
                            IssueKind::OrphanedRecord { agent: record.name.clone(), file },
                            Severity::Low,
                            "Orphaned process record",
                            format!(
                                "Record exists for '{}' but process {} is not running",
                                record.name, record.pid
                            ),
                            "Stale state may report agents that are not running",
                            format!("Delete the orphaned file: rm {}", path.display()),
                        ))
                    }
                    Ok(_) => {}
                }
            }
        }

        let log_dir = layout.log_dir();
        if log_dir.is_dir() {
            let size = dir_size(&log_dir);
            if size > self.config.log_size_limit {
                let days = self.config.log_retention.as_secs() / 86_400;
                issues.push(Issue::new(
                    IssueKind::LogsOversized,
                    Severity::Low,
                    "Large log directory",
                    format!("Log directory is {:.2} MB", size as f64 / MB),
                    "Consuming excessive disk space",
                    format!("Delete logs older than {days} days from {}", log_dir.display()),
                ));
            }
        }

        Ok(())
    }

    pub(super) fn check_permissions(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let root = self.config.layout.root();

        if root.exists() {
            if !root.is_dir() {
                issues.push(Issue::new(
                    IssueKind::StateRootNotDir,
                    Severity::Critical,
                    "State root is not a directory",
                    format!("{} exists but is a file", root.display()),
                    "Cannot store state, logs, or process records",
                    format!("Remove the file and recreate: rm {0} && mkdir {0}", root.display()),
                ));
            } else {
                let probe = root.join(".write_test");
                match std::fs::write(&probe, b"test") {
                    Ok(()) => {
                        let _ = std::fs::remove_file(&probe);
                    }
                    Err(e) => issues.push(Issue::new(
                        IssueKind::StateRootNotWritable,
                        Severity::Critical,
                        "State root not writable",
                        format!("Cannot write to {}: {e}", root.display()),
                        "Cannot store state, logs, or process records",
                        format!("Fix permissions: chmod 755 {}", root.display()),
                    )),
                }
            }
        }

        for subdir in StateSubdir::ALL {
            let path = self.config.layout.subdir(subdir);
            if !path.is_dir() {
                issues.push(Issue::new(
                    IssueKind::MissingSubdir { subdir },
                    Severity::Medium,
                    format!("Missing {subdir} directory"),
                    format!("Directory {} does not exist", path.display()),
                    format!("Cannot store {subdir}"),
                    format!("Create directory: mkdir -p {}", path.display()),
                ));
            }
        }

        Ok(())
    }

    pub(super) fn check_resources(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let root = self.config.layout.root();
        if root.is_dir() {
            let size = dir_size(root);
            if size > self.config.disk_usage_limit {
                issues.push(Issue::new(
                    IssueKind::DiskUsageHigh,
                    Severity::Medium,
                    "High disk usage",
                    format!("{} is using {:.2} MB", root.display(), size as f64 / MB),
                    "May run out of disk space",
                    "Clean up old logs and playbooks",
                ));
            }
        }

        for binary in &self.config.required_binaries {
            if which::which(binary).is_err() {
                let severity = if binary == "uv" { Severity::Medium } else { Severity::Critical };
                issues.push(Issue::new(
                    IssueKind::BinaryMissing { binary: binary.clone() },
                    severity,
                    format!("Missing required binary: {binary}"),
                    format!("'{binary}' was not found in PATH"),
                    format!("Cannot use features that require {binary}"),
                    format!("Install {binary} and ensure it is in your PATH"),
                ));
            }
        }

        Ok(())
    }

    pub(super) async fn check_network(&self, issues: &mut Vec<Issue>) -> Result<()> {
        // Missing or unparsable configs are reported by check_configuration
        let Ok(config) = Config::parse(&self.config.config_path) else {
            return Ok(());
        };

        let url = match config.services.coordinator.url.trim() {
            "" => DEFAULT_COORDINATOR_URL.to_string(),
            url => url.to_string(),
        };

        if !self.network_probe.is_reachable(&url).await {
            issues.push(Issue::new(
                IssueKind::CoordinatorUnreachable { url: url.clone() },
                Severity::Medium,
                "Coordination server unreachable",
                format!("No healthy response from {url}/health"),
                "Agents cannot coordinate and liveness cannot be tracked",
                format!("Start the coordination server or check the URL: curl {url}/health"),
            ));
        }

        Ok(())
    }

    pub(super) fn check_agents(&self, issues: &mut Vec<Issue>) -> Result<()> {
        let Ok(config) = Config::parse(&self.config.config_path) else {
            return Ok(());
        };

        for (name, agent) in &config.agents {
            if agent.command.trim().is_empty() {
                issues.push(Issue::new(
                    IssueKind::AgentNoCommand { agent: name.clone() },
                    Severity::Critical,
                    format!("Agent '{name}' has no command"),
                    "Agent configuration is missing the command field",
                    "Agent cannot be started",
                    format!("Add a command to [agent.{name}]"),
                ));
            }

            if !agent.model.is_empty() && agent.model.parse::<Model>().is_err() {
                issues.push(Issue::new(
                    IssueKind::AgentInvalidModel { agent: name.clone(), model: agent.model.clone() },
                    Severity::High,
                    format!("Agent '{name}' has invalid model"),
                    format!("Model '{}' is not recognized", agent.model),
                    "Agent may fail to start or authenticate",
                    format!("Use a supported model: {}", Model::supported()),
                ));
            }

            if agent.phases.is_empty() {
                issues.push(Issue::new(
                    IssueKind::AgentNoPhases { agent: name.clone() },
                    Severity::High,
                    format!("Agent '{name}' has no phases"),
                    "Agent configuration is missing phases",
                    "Agent will not pick up any tasks",
                    format!("Add phases to [agent.{name}]"),
                ));
            }
        }

        Ok(())
    }
}

/// Total size of regular files under `path`; unreadable entries are skipped.
pub(super) fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
