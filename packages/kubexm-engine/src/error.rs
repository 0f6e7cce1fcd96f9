use kubexm_api::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    // Plan-time validation
    #[error("cycle detected in execution graph: {0}")]
    CycleDetected(String),

    #[error("node {node} depends on unknown node {dependency}")]
    DanglingDependency { node: String, dependency: String },

    #[error("node {0} emitted twice with different structure")]
    DuplicateNodeMismatch(String),

    #[error("link references unknown predecessor {0}")]
    UnknownPredecessor(String),

    #[error("link references unknown successor {0}")]
    UnknownSuccessor(String),

    #[error("cluster config defect: {0}")]
    ConfigDefect(String),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    // Run-time
    #[error("transport error on {host}: {message}")]
    Transport { host: String, message: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("command `{command}` exited with {exit_code}: {stderr}")]
    RemoteCommand {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn config_defect<E: std::fmt::Display>(e: E) -> Self {
        Self::ConfigDefect(e.to_string())
    }

    pub fn transport(host: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            host: host.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::CycleDetected(_)
            | EngineError::DanglingDependency { .. }
            | EngineError::DuplicateNodeMismatch(_)
            | EngineError::UnknownPredecessor(_)
            | EngineError::UnknownSuccessor(_) => ErrorKind::PlanValidation,
            EngineError::ConfigDefect(_) | EngineError::Config(_) => ErrorKind::ConfigDefect,
            EngineError::Transport { .. } => ErrorKind::Transport,
            EngineError::Precondition(_) => ErrorKind::Precondition,
            EngineError::RemoteCommand { .. } => ErrorKind::RemoteCommand,
            EngineError::Timeout(_) => ErrorKind::Timeout,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Io(_) | EngineError::Serialization(_) | EngineError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a retry policy may re-run the failed attempt. Precondition
    /// failures retry only when the action opts in (checked separately by
    /// the executor).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Transport | ErrorKind::RemoteCommand | ErrorKind::Timeout
        )
    }
}

/// Error classification mirroring the failure taxonomy used by the
/// executor and the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    PlanValidation,
    ConfigDefect,
    Transport,
    Precondition,
    RemoteCommand,
    Timeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::PlanValidation => "plan_validation",
            ErrorKind::ConfigDefect => "config_defect",
            ErrorKind::Transport => "transport",
            ErrorKind::Precondition => "precondition",
            ErrorKind::RemoteCommand => "remote_command",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        let err = EngineError::Timeout("node x".to_string());
        assert!(err.is_retryable());

        let err = EngineError::Cancelled;
        assert!(!err.is_retryable());

        let err = EngineError::Precondition("swap enabled".to_string());
        assert!(!err.is_retryable());

        let err = EngineError::RemoteCommand {
            command: "systemctl start etcd".to_string(),
            exit_code: 1,
            stderr: String::new(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_plan_errors_classified() {
        let err = EngineError::CycleDetected("a -> b -> a".to_string());
        assert_eq!(err.kind(), ErrorKind::PlanValidation);
        assert!(!err.is_retryable());
    }
}
