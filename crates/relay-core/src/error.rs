use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Error taxonomy surfaced by the orchestration core. The daemon maps these
/// onto HTTP statuses; background sweepers log them and continue.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("project {0} not found")]
    ProjectNotFound(Uuid),
    #[error("workspace {0} not found")]
    WorkspaceNotFound(Uuid),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
    #[error("daily run quota exceeded")]
    QuotaExceeded,
    #[error("workspace for project {0} is not warm")]
    NoWarmWorkspace(Uuid),
    #[error("sandbox operation failed: {0}")]
    SandboxFailure(anyhow::Error),
    #[error("repository clone failed: {0}")]
    CloneFailure(String),
    #[error("agent exceeded the {0:?} run timeout")]
    AgentTimeout(Duration),
    #[error("agent invocation failed: {0}")]
    AgentFailure(String),
    #[error("evidence bundle assembly failed: {0}")]
    BundleFailure(String),
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Storage(anyhow::Error),
}

impl CoreError {
    /// Short machine-readable code used in terminal `run-complete` events.
    pub fn stream_code(&self) -> &'static str {
        match self {
            CoreError::QuotaExceeded => "quota_exceeded",
            CoreError::NoWarmWorkspace(_) => "workspace_not_warm",
            CoreError::AgentTimeout(_) => "timeout",
            CoreError::Canceled => "canceled",
            CoreError::CloneFailure(_) => "clone_failed",
            CoreError::SandboxFailure(_) => "sandbox_failure",
            CoreError::AgentFailure(_) => "agent_failure",
            CoreError::BundleFailure(_) => "bundle_failure",
            CoreError::ProjectNotFound(_)
            | CoreError::WorkspaceNotFound(_)
            | CoreError::RunNotFound(_) => "not_found",
            CoreError::Storage(_) => "internal",
        }
    }
}

impl From<anyhow::Error> for CoreError {
    fn from(value: anyhow::Error) -> Self {
        CoreError::Storage(value)
    }
}
