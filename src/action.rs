//! Action registry and the caller-supplied action/action-type contracts.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecResult, ExecutorError};

/// Bound required of caller-supplied action keys.
///
/// Keys must be hashable and cloneable so they can serve as map keys for
/// the task graph, and `Debug` so task identities show up in error
/// messages and tracing spans without extra ceremony from callers.
pub trait ActionKeyBound: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> ActionKeyBound for T where T: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static {}

/// Stable identifier for a registered action type, persisted in checkpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionTypeName(pub String);

impl ActionTypeName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl fmt::Display for ActionTypeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActionTypeName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A `(type-name, key)` reference to a prerequisite action.
#[derive(Debug, Clone)]
pub struct Dependency<K: ActionKeyBound> {
    pub action_type: ActionTypeName,
    pub key: K,
}

impl<K: ActionKeyBound> Dependency<K> {
    pub fn new(action_type: impl Into<ActionTypeName>, key: K) -> Self {
        Self {
            action_type: action_type.into(),
            key,
        }
    }

    pub(crate) fn task_id(&self) -> TaskId<K> {
        (self.action_type.clone(), self.key.clone())
    }
}

/// Composite identity `(type-name, key)` uniquely naming one action within
/// an execution.
pub type TaskId<K> = (ActionTypeName, K);

pub(crate) fn format_task_id<K: ActionKeyBound>(id: &TaskId<K>) -> String {
    format!("{}/{:?}", id.0, id.1)
}

/// A caller-defined unit of work: identity, dependencies, and an execute
/// operation, plus the serialization hooks needed for checkpointing.
///
/// `execute` is `async` (via `async_trait`) rather than blocking, since the
/// runner drives every task on the shared `tokio` runtime and real actions
/// are expected to do I/O.
#[async_trait]
pub trait Action<K: ActionKeyBound>: Send + Sync {
    /// The actions this one depends on. Must name only actions already
    /// added to the same execution.
    fn dependencies(&self) -> Vec<Dependency<K>>;

    /// This action's key, unique within its type.
    fn action_key(&self) -> K;

    /// Run the action's work. `Ok(())` marks the task completed; any error
    /// marks it failed and triggers execution-wide abort.
    async fn execute(&self) -> anyhow::Result<()>;

    /// Serialize this action to the durable blob form stored in a
    /// checkpoint.
    fn to_json(&self) -> ExecResult<String>;

    /// Populate a blank action (produced by [`ActionType::empty_action`])
    /// from a previously serialized blob. Must restore `action_key` and
    /// `dependencies` exactly.
    fn from_json(&mut self, blob: &str) -> ExecResult<()>;
}

/// A descriptor bound to a type-name: a factory for blank actions of that
/// type (used during resume) and the CPU-intensive flag.
pub trait ActionType<K: ActionKeyBound>: Send + Sync {
    fn type_name(&self) -> ActionTypeName;

    /// Produce a blank instance ready to be hydrated by
    /// [`Action::from_json`].
    fn empty_action(&self) -> Box<dyn Action<K>>;

    fn is_cpu_intensive(&self) -> bool;
}

/// Maps an action-type name to its descriptor. Construction fails if two
/// registered types share a name; the registry holds no per-run state.
pub struct ActionRegistry<K: ActionKeyBound> {
    types: HashMap<ActionTypeName, Arc<dyn ActionType<K>>>,
}

impl<K: ActionKeyBound> fmt::Debug for ActionRegistry<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: ActionKeyBound> ActionRegistry<K> {
    pub fn new(
        types: impl IntoIterator<Item = Arc<dyn ActionType<K>>>,
    ) -> ExecResult<Self> {
        let mut map = HashMap::new();
        for action_type in types {
            let name = action_type.type_name();
            if map.insert(name.clone(), action_type).is_some() {
                return Err(ExecutorError::DuplicateActionType(name));
            }
        }
        Ok(Self { types: map })
    }

    pub fn lookup(&self, name: &ActionTypeName) -> ExecResult<&Arc<dyn ActionType<K>>> {
        self.types
            .get(name)
            .ok_or_else(|| ExecutorError::UnknownActionType(name.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAction;

    #[async_trait]
    impl Action<String> for NoopAction {
        fn dependencies(&self) -> Vec<Dependency<String>> {
            vec![]
        }
        fn action_key(&self) -> String {
            "noop".to_string()
        }
        async fn execute(&self) -> anyhow::Result<()> {
            Ok(())
        }
        fn to_json(&self) -> ExecResult<String> {
            Ok("{}".to_string())
        }
        fn from_json(&mut self, _blob: &str) -> ExecResult<()> {
            Ok(())
        }
    }

    struct NoopType;

    impl ActionType<String> for NoopType {
        fn type_name(&self) -> ActionTypeName {
            ActionTypeName::new("noop")
        }
        fn empty_action(&self) -> Box<dyn Action<String>> {
            Box::new(NoopAction)
        }
        fn is_cpu_intensive(&self) -> bool {
            false
        }
    }

    #[test]
    fn rejects_duplicate_type_names() {
        let types: Vec<Arc<dyn ActionType<String>>> = vec![Arc::new(NoopType), Arc::new(NoopType)];
        let err = ActionRegistry::new(types).unwrap_err();
        assert!(matches!(err, ExecutorError::DuplicateActionType(_)));
    }

    #[test]
    fn lookup_fails_for_unknown_type() {
        let registry = ActionRegistry::<String>::new(vec![]).unwrap();
        let err = registry.lookup(&ActionTypeName::new("missing")).unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownActionType(_)));
    }
}
