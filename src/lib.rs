//! Checkpointed, dependency-ordered task executor.
//!
//! Accepts a batch of declaratively described actions with inter-action
//! dependencies, runs them concurrently while respecting those
//! dependencies and a configurable cap on CPU-intensive parallelism, and
//! persists progress so an aborted run can be resumed without re-executing
//! already-completed actions.
//!
//! # Modules
//!
//! - [`action`] — the [`action::Action`]/[`action::ActionType`] contracts callers implement,
//!   and the [`action::ActionRegistry`] mapping type-names to descriptors.
//! - [`runner`] — the dependency-respecting, CPU-gated [`runner::TaskRunner`].
//! - [`checkpoint`] — the durable [`checkpoint::Checkpoint`] record and the
//!   pluggable [`checkpoint::Checkpointer`] storage trait.
//! - [`execution`] — the [`execution::Execution`] controller tying the above
//!   together: add actions, run, checkpoint periodically, resume.
//! - [`error`] — the crate's unified [`error::ExecutorError`] type.
//!
//! # Example
//!
//! ```no_run
//! use std::num::NonZeroUsize;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use tasker_exec::action::ActionRegistry;
//! use tasker_exec::checkpoint::MemoryCheckpointer;
//! use tasker_exec::execution::{Execution, ExecutorConfig};
//!
//! # async fn run() -> Result<(), tasker_exec::error::ExecutorError> {
//! let registry = Arc::new(ActionRegistry::<String>::new(vec![])?);
//! let checkpointer = Arc::new(MemoryCheckpointer::new());
//! let config = ExecutorConfig::new(NonZeroUsize::new(4).unwrap(), Duration::from_secs(30));
//! let execution = Execution::new(registry, Some(checkpointer), config).await?;
//! execution.run().await
//! # }
//! ```

pub mod action;
pub mod checkpoint;
pub mod error;
pub mod execution;
pub mod runner;

pub use action::{Action, ActionKeyBound, ActionRegistry, ActionType, ActionTypeName, Dependency};
pub use checkpoint::{Checkpoint, CheckpointedAction, Checkpointer, FileCheckpointer, MemoryCheckpointer};
pub use error::{ExecResult, ExecutorError};
pub use execution::{Execution, ExecutorConfig};
pub use runner::TaskRunner;
