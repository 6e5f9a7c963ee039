//! Error types for supervisor operations

use asc_core::error::AscError;
use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No process record exists for this agent
    #[error("No process found for agent: {0}")]
    NotFound(String),

    /// Agent definition has a blank run command
    #[error("Agent {0} has an empty command")]
    EmptyCommand(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error(transparent)]
    Core(#[from] AscError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for SupervisorError {
    fn from(err: std::io::Error) -> Self {
        SupervisorError::Core(AscError::Io(err))
    }
}
