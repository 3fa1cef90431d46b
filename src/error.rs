//! Agent error kinds and their RPC mapping.
//!
//! Validation and NotFound surface verbatim as RPC errors. Transport and
//! Timeout failures inside a check are caught by the dispatcher and folded
//! into an `available=false` response instead, so a flapping upstream never
//! looks like a broken agent.

use thiserror::Error;

pub type Result<T, E = AgentError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed details, invalid process name, port out of range.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Unknown service type at dispatch time.
    #[error("no checker registered for type {0:?}")]
    NotFound(String),

    /// Dial, TLS handshake, or remote health failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Deadline elapsed during a check or handshake.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Interface busy, handle open failed, BPF filter invalid.
    #[error("resource error: {0}")]
    Resource(String),

    /// Configuration load failure; fatal during startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AgentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        AgentError::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        AgentError::Transport(msg.into())
    }

    /// True for failures the transport client may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::Transport(_) | AgentError::Timeout(_))
    }
}

impl From<tonic::transport::Error> for AgentError {
    fn from(e: tonic::transport::Error) -> Self {
        AgentError::Transport(e.to_string())
    }
}

impl From<tonic::Status> for AgentError {
    fn from(status: tonic::Status) -> Self {
        match status.code() {
            tonic::Code::DeadlineExceeded => AgentError::Timeout(status.message().to_string()),
            tonic::Code::InvalidArgument => AgentError::Validation(status.message().to_string()),
            _ => AgentError::Transport(status.message().to_string()),
        }
    }
}

impl From<AgentError> for tonic::Status {
    fn from(e: AgentError) -> Self {
        match &e {
            AgentError::Validation(msg) => tonic::Status::invalid_argument(msg.clone()),
            AgentError::NotFound(_) => tonic::Status::not_found(e.to_string()),
            AgentError::Timeout(msg) => tonic::Status::deadline_exceeded(msg.clone()),
            AgentError::Resource(msg) => tonic::Status::failed_precondition(msg.clone()),
            _ => tonic::Status::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_invalid_argument() {
        let status: tonic::Status = AgentError::validation("bad details").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert_eq!(status.message(), "bad details");
    }

    #[test]
    fn test_not_found_maps_to_not_found() {
        let status: tonic::Status = AgentError::NotFound("bogus".to_string()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(AgentError::transport("dial failed").is_retryable());
        assert!(AgentError::Timeout("rpc".into()).is_retryable());
        assert!(!AgentError::validation("nope").is_retryable());
        assert!(!AgentError::NotFound("x".into()).is_retryable());
    }
}
