//! Controller-level scenarios: resume fidelity, clear-on-success,
//! preserve-on-failure, and the start-fresh-over-a-checkpoint guard.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tasker_exec::action::{Action, ActionRegistry, ActionType, ActionTypeName, Dependency};
use tasker_exec::checkpoint::{Checkpoint, CheckpointedAction, MemoryCheckpointer};
use tasker_exec::error::{ExecResult, ExecutorError};
use tasker_exec::execution::{Execution, ExecutorConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExamplePayload {
    deps: Vec<(String, String)>,
    key: String,
}

/// `payload` sits behind a lock so a shared `Arc<ExampleAction>` handle can
/// still be hydrated by `from_json` during resume — the registry hands the
/// runner one clone while `ExampleType` keeps another for post-hoc test
/// inspection, so exclusive access is never available by the time
/// `from_json` runs.
#[derive(Debug, Default)]
struct ExampleAction {
    payload: Mutex<ExamplePayload>,
    ran: AtomicBool,
    fail: bool,
}

impl ExampleAction {
    fn new(key: &str, deps: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(ExamplePayload {
                deps: deps
                    .into_iter()
                    .map(|(t, k)| (t.to_string(), k.to_string()))
                    .collect(),
                key: key.to_string(),
            }),
            ran: AtomicBool::new(false),
            fail: false,
        })
    }

    fn failing(key: &str, deps: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            payload: Mutex::new(ExamplePayload {
                deps: deps
                    .into_iter()
                    .map(|(t, k)| (t.to_string(), k.to_string()))
                    .collect(),
                key: key.to_string(),
            }),
            ran: AtomicBool::new(false),
            fail: true,
        })
    }

    fn ran(&self) -> bool {
        self.ran.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Action<String> for Arc<ExampleAction> {
    fn dependencies(&self) -> Vec<Dependency<String>> {
        self.payload
            .lock()
            .unwrap()
            .deps
            .iter()
            .map(|(t, k)| Dependency::new(t.as_str(), k.clone()))
            .collect()
    }

    fn action_key(&self) -> String {
        self.payload.lock().unwrap().key.clone()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.ran.store(true, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("synthetic failure for {}", self.payload.lock().unwrap().key);
        }
        Ok(())
    }

    fn to_json(&self) -> ExecResult<String> {
        Ok(serde_json::to_string(&*self.payload.lock().unwrap())?)
    }

    fn from_json(&mut self, blob: &str) -> ExecResult<()> {
        *self.payload.lock().unwrap() = serde_json::from_str(blob)?;
        Ok(())
    }
}

/// Tracks every action instance the factory hands out, the way the
/// original source's `ExampleType.Generated` slice does.
#[derive(Debug, Default)]
struct ExampleType {
    generated: Mutex<Vec<Arc<ExampleAction>>>,
}

impl ActionType<String> for ExampleType {
    fn type_name(&self) -> ActionTypeName {
        ActionTypeName::new("ExampleType")
    }

    fn empty_action(&self) -> Box<dyn Action<String>> {
        let action = Arc::new(ExampleAction::default());
        self.generated.lock().unwrap().push(Arc::clone(&action));
        Box::new(action)
    }

    fn is_cpu_intensive(&self) -> bool {
        true
    }
}

fn config() -> ExecutorConfig {
    ExecutorConfig::new(NonZeroUsize::new(4).unwrap(), Duration::from_millis(5))
}

#[tokio::test]
async fn resume_skips_completed_actions() {
    // S2 — K1 incomplete, K2 complete, K3 depends on both.
    let checkpoint = Checkpoint {
        actions: vec![
            CheckpointedAction {
                action_type: ActionTypeName::new("ExampleType"),
                json_action: serde_json::to_string(&ExamplePayload {
                    deps: vec![],
                    key: "K1".to_string(),
                })
                .unwrap(),
                completed: false,
            },
            CheckpointedAction {
                action_type: ActionTypeName::new("ExampleType"),
                json_action: serde_json::to_string(&ExamplePayload {
                    deps: vec![],
                    key: "K2".to_string(),
                })
                .unwrap(),
                completed: true,
            },
            CheckpointedAction {
                action_type: ActionTypeName::new("ExampleType"),
                json_action: serde_json::to_string(&ExamplePayload {
                    deps: vec![
                        ("ExampleType".to_string(), "K1".to_string()),
                        ("ExampleType".to_string(), "K2".to_string()),
                    ],
                    key: "K3".to_string(),
                })
                .unwrap(),
                completed: false,
            },
        ],
    };
    let checkpointer = Arc::new(MemoryCheckpointer::seeded(checkpoint.to_bytes().unwrap()));
    let example_type = Arc::new(ExampleType::default());
    let registry = Arc::new(
        ActionRegistry::new(vec![Arc::clone(&example_type) as Arc<dyn ActionType<String>>])
            .unwrap(),
    );

    Execution::resume(registry, checkpointer.clone(), config())
        .await
        .unwrap();

    let generated = example_type.generated.lock().unwrap();
    assert_eq!(generated.len(), 3);
    assert!(generated[0].ran(), "K1 should run");
    assert!(!generated[1].ran(), "K2 was already completed");
    assert!(generated[2].ran(), "K3 should run");

    // Clean success clears the checkpoint.
    assert_eq!(checkpointer.read().await.unwrap(), None);
}

#[tokio::test]
async fn clear_on_success() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let example_type = Arc::new(ExampleType::default());
    let registry = Arc::new(
        ActionRegistry::new(vec![Arc::clone(&example_type) as Arc<dyn ActionType<String>>])
            .unwrap(),
    );
    let mut execution = Execution::new(registry, Some(checkpointer.clone()), config())
        .await
        .unwrap();
    execution
        .add_action(
            ActionTypeName::new("ExampleType"),
            Box::new(ExampleAction::new("K1", vec![])),
        )
        .unwrap();

    execution.run().await.unwrap();
    assert_eq!(checkpointer.read().await.unwrap(), None);
}

#[tokio::test]
async fn preserve_on_failure() {
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let example_type = Arc::new(ExampleType::default());
    let registry = Arc::new(
        ActionRegistry::new(vec![Arc::clone(&example_type) as Arc<dyn ActionType<String>>])
            .unwrap(),
    );
    let mut execution = Execution::new(registry, Some(checkpointer.clone()), config())
        .await
        .unwrap();
    execution
        .add_action(
            ActionTypeName::new("ExampleType"),
            Box::new(ExampleAction::failing("K1", vec![])),
        )
        .unwrap();

    let err = execution.run().await.unwrap_err();
    assert!(matches!(err, ExecutorError::Execution(_)));

    let blob = checkpointer.read().await.unwrap().expect("checkpoint preserved");
    let checkpoint = Checkpoint::from_bytes(&blob).unwrap();
    assert_eq!(checkpoint.actions.len(), 1);
    assert!(!checkpoint.actions[0].completed);
}

#[tokio::test]
async fn duplicate_key_is_rejected_without_mutating_checkpoint() {
    // S5 — second AddAction(K1) fails and leaves the checkpoint untouched.
    let checkpointer = Arc::new(MemoryCheckpointer::new());
    let example_type = Arc::new(ExampleType::default());
    let registry = Arc::new(
        ActionRegistry::new(vec![Arc::clone(&example_type) as Arc<dyn ActionType<String>>])
            .unwrap(),
    );
    let mut execution = Execution::new(registry, Some(checkpointer), config())
        .await
        .unwrap();
    execution
        .add_action(
            ActionTypeName::new("ExampleType"),
            Box::new(ExampleAction::new("K1", vec![])),
        )
        .unwrap();
    let err = execution
        .add_action(
            ActionTypeName::new("ExampleType"),
            Box::new(ExampleAction::new("K1", vec![])),
        )
        .unwrap_err();
    assert!(matches!(err, ExecutorError::DuplicateTask(_)));

    // The checkpoint still reflects exactly the one successful AddAction.
    assert_eq!(execution.checkpoint_snapshot().actions.len(), 1);
}

#[tokio::test]
async fn starting_fresh_over_existing_checkpoint_is_rejected() {
    // S6 — NewExecution (not resume) must fail when a checkpoint exists.
    let checkpoint = Checkpoint {
        actions: vec![CheckpointedAction {
            action_type: ActionTypeName::new("ExampleType"),
            json_action: "{}".to_string(),
            completed: false,
        }],
    };
    let checkpointer = Arc::new(MemoryCheckpointer::seeded(checkpoint.to_bytes().unwrap()));
    let registry = Arc::new(ActionRegistry::<String>::new(vec![]).unwrap());

    let err = Execution::new(registry, Some(checkpointer), config())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::CheckpointAlreadyPresent));
}
