//! On-disk state tree
//!
//! ```text
//! ~/.asc/
//!   pids/<agent>.json    process records
//!   logs/<agent>.log     agent output
//!   playbooks/           learned lessons
//! ```

use crate::error::{AscError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Name of the state root under the home directory
pub const STATE_DIR_NAME: &str = ".asc";

/// Standard subdirectories of the state root
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateSubdir {
    Pids,
    Logs,
    Playbooks,
}

impl StateSubdir {
    /// All standard subdirectories
    pub const ALL: [StateSubdir; 3] = [StateSubdir::Pids, StateSubdir::Logs, StateSubdir::Playbooks];

    /// Directory name under the state root
    pub fn dir_name(&self) -> &'static str {
        match self {
            StateSubdir::Pids => "pids",
            StateSubdir::Logs => "logs",
            StateSubdir::Playbooks => "playbooks",
        }
    }
}

impl fmt::Display for StateSubdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Paths of the state tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout rooted at `~/.asc`
    pub fn default_root() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| AscError::Configuration("failed to determine home directory".into()))?;
        Ok(Self::new(home.join(STATE_DIR_NAME)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn subdir(&self, subdir: StateSubdir) -> PathBuf {
        self.root.join(subdir.dir_name())
    }

    pub fn pid_dir(&self) -> PathBuf {
        self.subdir(StateSubdir::Pids)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.subdir(StateSubdir::Logs)
    }

    pub fn playbook_dir(&self) -> PathBuf {
        self.subdir(StateSubdir::Playbooks)
    }

    /// Process record file for an agent
    pub fn record_path(&self, name: &str) -> PathBuf {
        self.pid_dir().join(format!("{name}.json"))
    }

    /// Log file for an agent
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}.log"))
    }

    /// Create the root and every standard subdirectory.
    pub fn ensure(&self) -> Result<()> {
        for subdir in StateSubdir::ALL {
            std::fs::create_dir_all(self.subdir(subdir))?;
        }
        Ok(())
    }
}

/// Persisted record of a spawned agent process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: u32,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub started_at: DateTime<Utc>,
    pub log_file: PathBuf,
}

impl ProcessRecord {
    /// Read a record from disk.
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read(path.as_ref())?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Write the record as pretty JSON.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        Ok(())
    }
}
