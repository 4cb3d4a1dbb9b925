//! Error taxonomy for the executor: registry/graph validation failures,
//! checkpoint state conflicts, serialization/IO errors, and aggregated
//! execution failures.

use std::fmt;

use crate::action::ActionTypeName;

/// The result type returned by fallible operations across this crate.
pub type ExecResult<T> = Result<T, ExecutorError>;

/// A single task's failed `execute()`, tagged with the task that produced it.
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub error: anyhow::Error,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.task, self.error)
    }
}

/// An aggregate of one or more task failures, collected across a single run.
///
/// Ported from the original source's use of `hashicorp/go-multierror` —
/// there is no equivalent aggregation crate in the dependency set, so this
/// is a small hand-rolled newtype rather than pulling one in.
#[derive(Debug)]
pub struct MultiError(pub Vec<TaskFailure>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task(s) failed: ", self.0.len())?;
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("duplicate action type name: {0}")]
    DuplicateActionType(ActionTypeName),

    #[error("unrecognized action type: {0}")]
    UnknownActionType(ActionTypeName),

    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    #[error("task {0} depends on an unregistered task {1}")]
    MissingDependency(String, String),

    #[error("cannot start a new execution when a checkpoint is already present")]
    CheckpointAlreadyPresent,

    #[error("no checkpoint to restore")]
    NoCheckpointToResume,

    #[error("action (de)serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("checkpointer I/O failed: {0}")]
    Checkpointer(#[source] anyhow::Error),

    #[error("{0}")]
    Execution(#[source] MultiError),

    #[error("execution failed: {0:?}")]
    Aggregate(Vec<ExecutorError>),
}

impl ExecutorError {
    /// Build a [`ExecutorError::Checkpointer`] from any error type, the way
    /// caller-supplied `Checkpointer` implementations are expected to.
    pub fn checkpointer(err: impl Into<anyhow::Error>) -> Self {
        ExecutorError::Checkpointer(err.into())
    }
}
