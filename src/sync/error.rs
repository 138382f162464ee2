use std::time::Duration;

use crate::icc::network::error::NetworkError;

#[derive(Debug, thiserror::Error)]
pub enum BridgerError {
    #[error("No free bridge index: all {capacity} tenant networks are in use")]
    ResourceExhausted { capacity: usize },

    #[error("Desktop container {container_id} is not ready: {reason}")]
    ContainerNotReady {
        container_id: String,
        reason: String,
    },

    #[error("Unknown scope: {scope_id}")]
    UnknownScope { scope_id: String },

    #[error("Isolated daemon for scope {scope_id} is not running (status: {status})")]
    ScopeNotRunning { scope_id: String, status: String },

    #[error("Kernel operation failed: {operation}: {source}")]
    KernelOperationFailed {
        operation: String,
        #[source]
        source: NetworkError,
    },

    #[error("Isolated daemon for scope {scope_id} not ready after {waited:?}: {reason}")]
    DaemonStartTimeout {
        scope_id: String,
        waited: Duration,
        reason: String,
    },

    #[error("Privileged mode is not enabled on this server")]
    PrivilegedModeDisabled,

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Container runtime error: {message}")]
    Runtime { message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgerError {
    pub fn kernel(operation: impl Into<String>, source: NetworkError) -> Self {
        BridgerError::KernelOperationFailed {
            operation: operation.into(),
            source,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        BridgerError::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        BridgerError::Runtime {
            message: message.into(),
        }
    }

    /// Stable variant name used in API error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            BridgerError::ResourceExhausted { .. } => "ResourceExhausted",
            BridgerError::ContainerNotReady { .. } => "ContainerNotReady",
            BridgerError::UnknownScope { .. } => "UnknownScope",
            BridgerError::ScopeNotRunning { .. } => "ScopeNotRunning",
            BridgerError::KernelOperationFailed { .. } => "KernelOperationFailed",
            BridgerError::DaemonStartTimeout { .. } => "DaemonStartTimeout",
            BridgerError::PrivilegedModeDisabled => "PrivilegedModeDisabled",
            BridgerError::InvalidRequest { .. } => "InvalidRequest",
            BridgerError::Runtime { .. } => "Runtime",
            BridgerError::Io(_) => "Io",
        }
    }
}

pub type BridgerResult<T> = Result<T, BridgerError>;
