//! Starter configurations written by `asc init` and the missing-config fix

use crate::error::{AscError, Result};
use std::fmt;
use std::str::FromStr;

const SOLO: &str = r#"# Single-agent setup

[core]
task_store = "./project-repo"

[services.coordinator]
start_command = "python -m coordinator.server"
url = "http://localhost:8765"

[agent.main-agent]
command = "python agent_adapter.py"
model = "claude"
phases = ["planning", "implementation", "testing"]
"#;

const TEAM: &str = r#"# Three-agent team: planner, coder, reviewer

[core]
task_store = "./project-repo"

[services.coordinator]
start_command = "python -m coordinator.server"
url = "http://localhost:8765"

[agent.planner]
command = "python agent_adapter.py"
model = "gemini"
phases = ["planning", "design"]

[agent.coder]
command = "python agent_adapter.py"
model = "claude"
phases = ["implementation", "coding"]

[agent.reviewer]
command = "python agent_adapter.py"
model = "gpt-4"
phases = ["testing", "review"]
"#;

/// Built-in configuration template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Template {
    #[default]
    Solo,
    Team,
}

impl Template {
    /// TOML text of the template
    pub fn render(&self) -> &'static str {
        match self {
            Template::Solo => SOLO,
            Template::Team => TEAM,
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Template::Solo => f.write_str("solo"),
            Template::Team => f.write_str("team"),
        }
    }
}

impl FromStr for Template {
    type Err = AscError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "solo" => Ok(Template::Solo),
            "team" => Ok(Template::Team),
            other => Err(AscError::Configuration(format!(
                "unknown template '{other}' (available: solo, team)"
            ))),
        }
    }
}
