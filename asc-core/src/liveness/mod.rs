//! Agent liveness tracking
//!
//! Two paths feed agent health: [`CoordinatorClient`] polls heartbeats over
//! HTTP with a retry policy, and [`EventStreamClient`] keeps a WebSocket
//! subscription open and reconnects with backoff when it drops. Both express
//! agent health as an [`AgentStatus`].

pub mod client;
pub mod retry;
pub mod stream;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

pub use client::CoordinatorClient;
pub use retry::RetryPolicy;
pub use stream::{EventStreamClient, StreamConfig};

/// Self-reported or derived agent state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Working,
    Error,
    Offline,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "idle",
            AgentState::Working => "working",
            AgentState::Error => "error",
            AgentState::Offline => "offline",
        };
        f.write_str(s)
    }
}

/// Computed status of one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub name: String,
    pub state: AgentState,
    #[serde(default, deserialize_with = "empty_as_none")]
    pub current_task: Option<String>,
    /// `None` when the agent has never been seen
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl AgentStatus {
    /// Status for an agent with no heartbeat at all
    pub fn never_seen(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AgentState::Offline,
            current_task: None,
            last_seen: None,
        }
    }
}

/// Periodic self-report from an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_name: String,
    pub state: AgentState,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "empty_as_none")]
    pub current_task: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Kind of coordination message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Lease,
    #[serde(alias = "beads")]
    Task,
    Error,
    Message,
}

/// Message exchanged through the coordination server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub source: String,
    pub content: String,
}

/// Event delivered on the liveness event queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Stream (re)established
    Connected,
    /// Stream lost
    Disconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// An agent's status changed
    AgentStatus { agent_status: AgentStatus },
    /// A new coordination message was posted
    NewMessage { message: Message },
    /// Server-reported error
    Error { error: String },
}

/// Convert a heartbeat into a status.
///
/// The self-reported state is used unless the heartbeat is older than
/// `offline_threshold`, in which case the agent is offline regardless.
pub fn heartbeat_to_status(
    heartbeat: &Heartbeat,
    now: DateTime<Utc>,
    offline_threshold: Duration,
) -> AgentStatus {
    let stale = match (now - heartbeat.timestamp).to_std() {
        Ok(age) => age > offline_threshold,
        // Timestamp in the future: clock skew, not silence
        Err(_) => false,
    };

    AgentStatus {
        name: heartbeat.agent_name.clone(),
        state: if stale { AgentState::Offline } else { heartbeat.state },
        current_task: heartbeat.current_task.clone(),
        last_seen: Some(heartbeat.timestamp),
    }
}

fn empty_as_none<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}
