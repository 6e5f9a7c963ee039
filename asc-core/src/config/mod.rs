//! Fleet configuration: model, loading and validation
//!
//! The fleet is described by a TOML file with a `[core]` section, a
//! `[services.coordinator]` section and one `[agent.<name>]` table per agent:
//!
//! ```toml
//! [core]
//! task_store = "./project-repo"
//!
//! [services.coordinator]
//! start_command = "python -m coordinator.server"
//! url = "http://localhost:8765"
//!
//! [agent.planner]
//! command = "python agent_adapter.py"
//! model = "gemini"
//! phases = ["planning", "design"]
//! ```

pub mod env;
pub mod settings;
pub mod templates;
pub mod watcher;

use crate::error::{AscError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use env::load_env_file;
pub use settings::ControllerSettings;
pub use templates::Template;
pub use watcher::{ConfigWatcher, ReloadHandler};

/// Default location of the task store when `[core]` omits it
pub const DEFAULT_TASK_STORE: &str = "./project-repo";

/// Default coordination server URL
pub const DEFAULT_COORDINATOR_URL: &str = "http://localhost:8765";

/// Default command used to launch the coordination server
pub const DEFAULT_COORDINATOR_COMMAND: &str = "python -m coordinator.server";

/// Workflow phases an agent may be assigned
pub const KNOWN_PHASES: &[&str] = &[
    "planning",
    "design",
    "implementation",
    "coding",
    "testing",
    "review",
    "refactor",
    "documentation",
    "debugging",
    "optimization",
    "deployment",
];

/// Phases that should be covered by at least one agent
const CRITICAL_PHASES: &[&str] = &["planning", "implementation", "testing"];

/// Complete fleet configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Core settings
    #[serde(default)]
    pub core: CoreConfig,

    /// External services the fleet depends on
    #[serde(default)]
    pub services: ServicesConfig,

    /// Agent definitions keyed by name
    #[serde(default, rename = "agent")]
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Core settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Location of the task store
    #[serde(default)]
    pub task_store: String,
}

/// External service descriptors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Coordination server
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

/// Coordination server descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Command that launches the server
    #[serde(default)]
    pub start_command: String,

    /// HTTP base URL of the server
    #[serde(default)]
    pub url: String,
}

impl CoordinatorConfig {
    /// Event stream endpoint derived from the HTTP URL (`http` → `ws`, `/ws` path).
    pub fn stream_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{base}/ws")
    }

    /// `start_command` split into program and arguments, `None` when blank
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        split_command(&self.start_command)
    }
}

/// Whitespace-split a command line into its program and arguments.
fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Definition of a single agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Command line that runs the agent
    #[serde(default)]
    pub command: String,

    /// Model identifier
    #[serde(default)]
    pub model: String,

    /// Ordered workflow phases
    #[serde(default)]
    pub phases: Vec<String>,
}

impl AgentConfig {
    /// Split the command into program and arguments on whitespace.
    ///
    /// Returns `None` for a blank command.
    pub fn program_and_args(&self) -> Option<(String, Vec<String>)> {
        split_command(&self.command)
    }
}

/// Supported model identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Model {
    Claude,
    Gemini,
    #[serde(rename = "gpt-4")]
    Gpt4,
    Codex,
    OpenAi,
}

impl Model {
    /// Every supported model
    pub const ALL: [Model; 5] = [
        Model::Claude,
        Model::Gemini,
        Model::Gpt4,
        Model::Codex,
        Model::OpenAi,
    ];

    /// Canonical identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Model::Claude => "claude",
            Model::Gemini => "gemini",
            Model::Gpt4 => "gpt-4",
            Model::Codex => "codex",
            Model::OpenAi => "openai",
        }
    }

    /// Comma-separated list for error messages
    pub fn supported() -> String {
        Model::ALL
            .iter()
            .map(Model::as_str)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Model {
    type Err = AscError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.to_lowercase();
        Model::ALL
            .into_iter()
            .find(|m| m.as_str() == lower)
            .ok_or_else(|| AscError::Configuration(format!("unsupported model '{s}'")))
    }
}

/// Non-fatal configuration advisory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// What was noticed
    pub message: String,
    /// What to do about it
    pub suggestion: String,
}

impl Config {
    /// Parse a configuration file without applying defaults or validation.
    ///
    /// Diagnostics use this to inspect files that parse but would not load.
    ///
    /// # Errors
    ///
    /// Returns [`AscError::ConfigNotFound`] if the file does not exist and
    /// [`AscError::Configuration`] if it is not well-formed TOML of the expected shape.
    pub fn parse(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        let path = path.as_ref();
        if !path.exists() {
            return Err(AscError::ConfigNotFound(path.to_path_buf()));
        }

        Figment::new()
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                AscError::Configuration(format!("Failed to parse configuration file: {}", e))
            })
    }

    /// Parse configuration from a TOML string without validation.
    pub fn parse_str(content: &str) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Toml},
        };

        Figment::new()
            .merge(Toml::string(content))
            .extract()
            .map_err(|e| AscError::Configuration(format!("Failed to parse configuration: {}", e)))
    }

    /// Load, default and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed or fails validation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::parse(path)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Fill optional fields with their defaults.
    pub fn apply_defaults(&mut self) {
        if self.core.task_store.is_empty() {
            self.core.task_store = DEFAULT_TASK_STORE.to_string();
        }
        if self.services.coordinator.url.is_empty() {
            self.services.coordinator.url = DEFAULT_COORDINATOR_URL.to_string();
        }
        if self.services.coordinator.start_command.is_empty() {
            self.services.coordinator.start_command = DEFAULT_COORDINATOR_COMMAND.to_string();
        }
    }

    /// Validate the configuration, expanding the task store path in place.
    ///
    /// Agent names must be unique ignoring case; `Planner` and `planner` in the
    /// same file are rejected rather than merged.
    ///
    /// # Errors
    ///
    /// Returns [`AscError::Configuration`] describing the first violation.
    pub fn validate(&mut self) -> Result<()> {
        if self.core.task_store.is_empty() {
            return Err(AscError::Configuration("core.task_store is required".into()));
        }
        self.core.task_store = expand_path(&self.core.task_store)?
            .to_string_lossy()
            .into_owned();

        if self.services.coordinator.start_command.trim().is_empty() {
            return Err(AscError::Configuration(
                "services.coordinator.start_command is required".into(),
            ));
        }
        if self.services.coordinator.url.trim().is_empty() {
            return Err(AscError::Configuration("services.coordinator.url is required".into()));
        }

        if self.agents.is_empty() {
            return Err(AscError::Configuration("at least one agent must be defined".into()));
        }

        let mut seen: HashMap<String, &str> = HashMap::new();
        for name in self.agents.keys() {
            if let Some(existing) = seen.insert(name.to_lowercase(), name) {
                return Err(AscError::Configuration(format!(
                    "duplicate agent name: '{existing}' and '{name}' (agent names are case-insensitive)"
                )));
            }
        }

        for (name, agent) in &self.agents {
            validate_agent(name, agent)?;
        }

        Ok(())
    }

    /// Advisories that do not prevent loading.
    pub fn warnings(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();

        let models: std::collections::BTreeSet<String> = self
            .agents
            .values()
            .map(|a| a.model.to_lowercase())
            .collect();
        if models.len() == 1 && self.agents.len() > 1 {
            if let Some(model) = models.iter().next() {
                warnings.push(ValidationWarning {
                    message: format!("All agents are using the same model ({model})"),
                    suggestion: "Consider mixing models so agents cover each other's weaknesses"
                        .into(),
                });
            }
        }

        let mut by_phase: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (name, agent) in &self.agents {
            for phase in &agent.phases {
                by_phase.entry(phase.as_str()).or_default().push(name.as_str());
            }
        }
        for (phase, agents) in &by_phase {
            if agents.len() > 3 {
                warnings.push(ValidationWarning {
                    message: format!(
                        "Phase '{phase}' has {} agents assigned: {}",
                        agents.len(),
                        agents.join(", ")
                    ),
                    suggestion: "Too many agents on one phase may contend for the same tasks"
                        .into(),
                });
            }
        }

        for critical in CRITICAL_PHASES {
            if !by_phase.contains_key(critical) {
                warnings.push(ValidationWarning {
                    message: format!("No agent is assigned to the '{critical}' phase"),
                    suggestion: format!("Add an agent covering '{critical}'"),
                });
            }
        }

        for (name, agent) in &self.agents {
            if let Some((program, _)) = agent.program_and_args() {
                if which::which(&program).is_err() {
                    warnings.push(ValidationWarning {
                        message: format!("Agent '{name}': command '{program}' not found in PATH"),
                        suggestion: "Install the binary or fix PATH before starting the fleet"
                            .into(),
                    });
                }
            }
        }

        warnings
    }
}

fn validate_agent(name: &str, agent: &AgentConfig) -> Result<()> {
    if agent.command.trim().is_empty() {
        return Err(AscError::Configuration(format!("agent '{name}': command is required")));
    }

    if agent.model.is_empty() {
        return Err(AscError::Configuration(format!("agent '{name}': model is required")));
    }
    if agent.model.parse::<Model>().is_err() {
        return Err(AscError::Configuration(format!(
            "agent '{name}': unsupported model '{}' (supported: {})",
            agent.model,
            Model::supported()
        )));
    }

    if agent.phases.is_empty() {
        return Err(AscError::Configuration(format!(
            "agent '{name}': at least one phase is required"
        )));
    }
    for phase in &agent.phases {
        if !is_known_phase(phase) {
            let mut msg = format!(
                "agent '{name}': invalid phase '{phase}' (valid: {})",
                KNOWN_PHASES.join(", ")
            );
            if let Some(suggestion) = suggest_phase(phase) {
                msg.push_str(&format!(", did you mean '{suggestion}'?"));
            }
            return Err(AscError::Configuration(msg));
        }
    }

    Ok(())
}

/// Whether `phase` is one of [`KNOWN_PHASES`], ignoring case
pub fn is_known_phase(phase: &str) -> bool {
    let lower = phase.to_lowercase();
    KNOWN_PHASES.contains(&lower.as_str())
}

/// Closest known phase for a typo or abbreviation
pub fn suggest_phase(input: &str) -> Option<&'static str> {
    let input = input.to_lowercase();
    if input.is_empty() {
        return None;
    }

    if let Some(found) = KNOWN_PHASES
        .iter()
        .copied()
        .find(|p| p.contains(input.as_str()) || input.contains(p))
    {
        return Some(found);
    }

    match input.as_str() {
        "code" => Some("coding"),
        "docs" => Some("documentation"),
        _ => None,
    }
}

/// Expand a leading `~` and make the path absolute.
pub fn expand_path(path: &str) -> Result<PathBuf> {
    let expanded = match path.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir().ok_or_else(|| {
                AscError::Configuration("failed to determine home directory".into())
            })?;
            home.join(rest.trim_start_matches('/'))
        }
        None => PathBuf::from(path),
    };

    std::path::absolute(&expanded).map_err(|e| {
        AscError::Configuration(format!("failed to resolve '{}': {e}", expanded.display()))
    })
}
