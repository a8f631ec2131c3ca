use thiserror::Error;
use wardend_protocol::{ErrorCode, RpcError};

/// Error kinds surfaced to clients. Each variant maps onto one wire
/// [`ErrorCode`]; everything else is recovered locally and logged.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type AgentResult<T> = Result<T, AgentError>;

impl AgentError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AgentError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            AgentError::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
            AgentError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            AgentError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            AgentError::NotFound(_) => ErrorCode::NotFound,
            AgentError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            AgentError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn to_rpc(&self) -> RpcError {
        let message = match self {
            AgentError::Unauthenticated(m)
            | AgentError::ResourceExhausted(m)
            | AgentError::PermissionDenied(m)
            | AgentError::InvalidArgument(m)
            | AgentError::NotFound(m)
            | AgentError::FailedPrecondition(m)
            | AgentError::Internal(m) => m.clone(),
        };
        RpcError::new(self.code(), message)
    }

    /// Classify an I/O error against the path it touched.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => {
                AgentError::NotFound(format!("{}: {}", context, err))
            }
            std::io::ErrorKind::PermissionDenied => {
                AgentError::PermissionDenied(format!("{}: {}", context, err))
            }
            _ => AgentError::Internal(format!("{}: {}", context, err)),
        }
    }
}
