//! Error kinds shared across the agent.
//!
//! Worker loops catch these at their own top and either retry on the next
//! tick or abort the single-shot startup pipeline; API handlers map them to
//! status codes. Nothing here crosses a worker boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// HTTP/UDP/TCP I/O failure talking to a peer or collaborator.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The peer answered, but not with what the protocol promises.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Malformed policy payload.
    #[error("policy payload rejected: {0}")]
    Policy(String),

    /// The requested role transition is not permitted in the current state.
    #[error("state transition not permitted: {0}")]
    State(String),

    /// Unknown deviceID.
    #[error("device not found: {0}")]
    NotFound(String),
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}
