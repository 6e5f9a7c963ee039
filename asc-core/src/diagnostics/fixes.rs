//! Remediations, dispatched on [`IssueKind`]

use super::{Diagnostics, IssueKind};
use crate::config::Template;
use crate::error::{AscError, Result};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::time::SystemTime;

impl Diagnostics {
    /// Apply the remediation for `kind`, returning a description of what was done.
    pub(super) fn apply_fix(&self, kind: &IssueKind) -> Result<String> {
        let layout = &self.config.layout;

        match kind {
            IssueKind::ConfigMissing => self.write_default_config(),
            IssueKind::EnvPermissions => {
                set_mode(&self.config.env_path, 0o600)?;
                Ok("Set .env permissions to 600".into())
            }
            IssueKind::StateRootNotDir => {
                let root = layout.root();
                if root.is_file() {
                    std::fs::remove_file(root)?;
                }
                std::fs::create_dir_all(root)?;
                Ok(format!("Replaced file {} with a directory", root.display()))
            }
            IssueKind::StateRootNotWritable => {
                set_mode(layout.root(), 0o755)?;
                Ok(format!("Set {} permissions to 755", layout.root().display()))
            }
            IssueKind::MissingSubdir { subdir } => {
                let path = layout.subdir(*subdir);
                std::fs::create_dir_all(&path)?;
                Ok(format!("Created directory {}", path.display()))
            }
            IssueKind::CorruptedRecord { file } => {
                remove_record(&layout.pid_dir().join(file))?;
                Ok(format!("Removed corrupted process record {file}"))
            }
            IssueKind::OrphanedRecord { agent, file } => {
                remove_record(&layout.pid_dir().join(file))?;
                Ok(format!("Removed orphaned process record for {agent}"))
            }
            IssueKind::LogsOversized => {
                let deleted = self.prune_old_logs()?;
                Ok(format!("Deleted {deleted} old log files"))
            }
            IssueKind::ConfigInvalid
            | IssueKind::EnvMissing
            | IssueKind::DiskUsageHigh
            | IssueKind::BinaryMissing { .. }
            | IssueKind::CoordinatorUnreachable { .. }
            | IssueKind::AgentNoCommand { .. }
            | IssueKind::AgentInvalidModel { .. }
            | IssueKind::AgentNoPhases { .. } => Err(AscError::Other(format!(
                "no automatic fix for {}",
                kind.id()
            ))),
        }
    }

    fn write_default_config(&self) -> Result<String> {
        let path = &self.config.config_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(Template::Solo.render().as_bytes())?;
                Ok(format!("Created {} from the solo template", path.display()))
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Ok(format!("{} already exists", path.display()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete log files older than the retention period, whatever their size.
    fn prune_old_logs(&self) -> Result<usize> {
        let log_dir = self.config.layout.log_dir();
        let now = SystemTime::now();
        let mut deleted = 0;

        for entry in walkdir::WalkDir::new(&log_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            let Some(modified) = entry.metadata().ok().and_then(|m| m.modified().ok()) else {
                continue;
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age <= self.config.log_retention {
                continue;
            }

            match std::fs::remove_file(entry.path()) {
                Ok(()) => deleted += 1,
                Err(e) => tracing::warn!(
                    parent: &self.span,
                    path = %entry.path().display(),
                    error = %e,
                    "failed to delete old log"
                ),
            }
        }

        Ok(deleted)
    }
}

fn remove_record(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(path: &Path, _mode: u32) -> Result<()> {
    Err(AscError::Other(format!(
        "cannot change permissions of {} on this platform",
        path.display()
    )))
}
