use crate::store::StoreError;
use crate::types::{ExecutionId, InstanceId, JobId};

/// Failures surfaced through the command boundary. Callers of
/// `CommandExecutor::execute` see either the command's result or exactly one
/// of these; never a partially applied agenda.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Double-close of a command context is a programming error.
    #[error("command context is already closed")]
    ContextClosed,

    #[error("process definition `{0}` not found")]
    DefinitionNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(ExecutionId),

    #[error("process instance {0} not found")]
    ProcessInstanceNotFound(InstanceId),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("execution {0} is not waiting at a trigger point")]
    NotWaiting(ExecutionId),

    #[error("execution {0} has no current element")]
    NoCurrentElement(ExecutionId),

    #[error("element `{0}` not found in definition")]
    ElementNotFound(String),

    #[error("element `{0}` has no outgoing sequence flow")]
    NoOutgoingFlow(String),

    #[error("no sequence flow condition matched at `{0}` and no default flow")]
    NoFlowTaken(String),

    /// A before-execute listener rejected the operation.
    #[error("operation listener rejected `{operation}`: {reason}")]
    ListenerRejected { operation: String, reason: String },

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Model(#[from] crate::model::ModelError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Whether a retry from a clean transaction could succeed (optimistic
    /// lock conflicts). Retry itself belongs to the external job executor.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Conflict(_)))
    }
}
