//! The execution controller: wraps a [`TaskRunner`] with a [`Checkpoint`]
//! record, persisting progress on a periodic tick and orchestrating resume.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::action::{Action, ActionKeyBound, ActionRegistry, ActionTypeName, TaskId};
use crate::checkpoint::{Checkpoint, CheckpointedAction, Checkpointer};
use crate::error::ExecutorError;
use crate::runner::TaskRunner;

/// The two knobs a caller supplies, independent of the checkpoint blob
/// itself: the CPU-gate capacity and how often progress is snapshotted.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub max_cpu_intensive_tasks: NonZeroUsize,
    pub checkpoint_interval: Duration,
}

impl ExecutorConfig {
    pub fn new(max_cpu_intensive_tasks: NonZeroUsize, checkpoint_interval: Duration) -> Self {
        Self {
            max_cpu_intensive_tasks,
            checkpoint_interval,
        }
    }
}

/// Wraps a [`TaskRunner`] with checkpoint bookkeeping: actions are appended
/// to the checkpoint as they're added, and each task's on-finish hook flips
/// its `completed` flag under the same lock the periodic serializer takes.
pub struct Execution<K: ActionKeyBound> {
    registry: Arc<ActionRegistry<K>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    checkpoint: Arc<Mutex<Checkpoint>>,
    runner: TaskRunner<K>,
    config: ExecutorConfig,
}

impl<K: ActionKeyBound> std::fmt::Debug for Execution<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("registry", &self.registry)
            .field("runner", &self.runner)
            .field("config", &self.config)
            .finish()
    }
}

impl<K: ActionKeyBound> Execution<K> {
    /// Start a fresh execution. If `checkpointer` is provided, it must not
    /// already hold a checkpoint — that would mean overwriting in-progress
    /// state from a previous run; use [`Execution::resume`] instead.
    pub async fn new(
        registry: Arc<ActionRegistry<K>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        config: ExecutorConfig,
    ) -> Result<Self, ExecutorError> {
        if let Some(checkpointer) = &checkpointer {
            if checkpointer.read().await?.is_some() {
                return Err(ExecutorError::CheckpointAlreadyPresent);
            }
        }
        Ok(Self {
            registry,
            checkpointer,
            checkpoint: Arc::new(Mutex::new(Checkpoint::default())),
            runner: TaskRunner::new(config.max_cpu_intensive_tasks),
            config,
        })
    }

    /// Serialize `action`, append it to the checkpoint, and register it
    /// with the runner. Not supported once [`Execution::run`] has
    /// started — `run` consumes `self`, so the compiler enforces this.
    pub fn add_action(
        &mut self,
        type_name: ActionTypeName,
        action: Box<dyn Action<K>>,
    ) -> Result<(), ExecutorError> {
        let action_type = self.registry.lookup(&type_name)?.clone();
        let json_action = action.to_json()?;
        let key = action.action_key();

        let index = {
            let mut checkpoint = self.checkpoint.lock().expect("checkpoint lock poisoned");
            let index = checkpoint.actions.len();
            checkpoint.actions.push(CheckpointedAction {
                action_type: type_name.clone(),
                json_action,
                completed: false,
            });
            index
        };

        let checkpoint = Arc::clone(&self.checkpoint);
        let on_finish = move || {
            checkpoint
                .lock()
                .expect("checkpoint lock poisoned")
                .actions[index]
                .completed = true;
        };

        let task_id: TaskId<K> = (type_name, key);
        let is_cpu_intensive = action_type.is_cpu_intensive();
        if let Err(err) = self.runner.add_task(is_cpu_intensive, task_id, action, on_finish) {
            // Graph errors must leave the checkpoint as if AddAction never
            // happened: roll back the entry we just reserved.
            self.checkpoint
                .lock()
                .expect("checkpoint lock poisoned")
                .actions
                .truncate(index);
            return Err(err);
        }
        Ok(())
    }

    /// A snapshot of the checkpoint record as it stands right now. Useful
    /// for status reporting and tests; the returned value does not track
    /// subsequent mutations.
    pub fn checkpoint_snapshot(&self) -> Checkpoint {
        self.checkpoint.lock().expect("checkpoint lock poisoned").clone()
    }

    fn save_checkpoint_bytes(&self) -> Result<Vec<u8>, ExecutorError> {
        self.checkpoint
            .lock()
            .expect("checkpoint lock poisoned")
            .to_bytes()
    }

    async fn save_checkpoint(&self) -> Result<(), ExecutorError> {
        if let Some(checkpointer) = &self.checkpointer {
            let bytes = self.save_checkpoint_bytes()?;
            checkpointer.write(Some(&bytes)).await?;
        }
        Ok(())
    }

    /// Run every registered task to completion, periodically snapshotting
    /// progress. Clears the checkpoint on clean success; leaves the last
    /// snapshot intact on any failure.
    #[instrument(skip(self), fields(actions = self.runner.len()))]
    pub async fn run(self) -> Result<(), ExecutorError> {
        info!("starting execution");
        // Always save on entry, even when resumed — a crash immediately
        // after resuming is still resumable from an up-to-date snapshot.
        self.save_checkpoint().await?;

        let abort = CancellationToken::new();
        let ticker_handle = tokio::spawn(Self::run_ticker(
            Arc::clone(&self.checkpoint),
            self.checkpointer.clone(),
            self.config.checkpoint_interval,
            abort.clone(),
        ));

        let run_result = self.runner.run(abort.clone()).await;
        // Stop the ticker regardless of outcome; if it already aborted us
        // (a checkpoint write failed) this is a no-op.
        abort.cancel();
        let ticker_result = ticker_handle.await.expect("checkpoint ticker task panicked");

        match (run_result, ticker_result) {
            (Ok(()), Ok(())) => {
                if let Some(checkpointer) = &self.checkpointer {
                    checkpointer.write(None).await?;
                }
                info!("execution completed successfully, checkpoint cleared");
                Ok(())
            }
            (run_result, ticker_result) => {
                let mut errors = Vec::new();
                if let Err(e) = run_result {
                    errors.push(e);
                }
                if let Err(e) = ticker_result {
                    errors.push(e);
                }
                warn!(error_count = errors.len(), "execution failed, checkpoint preserved");
                Err(if errors.len() == 1 {
                    errors.into_iter().next().expect("checked len == 1")
                } else {
                    ExecutorError::Aggregate(errors)
                })
            }
        }
    }

    async fn run_ticker(
        checkpoint: Arc<Mutex<Checkpoint>>,
        checkpointer: Option<Arc<dyn Checkpointer>>,
        interval: Duration,
        abort: CancellationToken,
    ) -> Result<(), ExecutorError> {
        let Some(checkpointer) = checkpointer else {
            // No storage configured: nothing to tick, just wait for the run
            // to finish.
            abort.cancelled().await;
            return Ok(());
        };
        let mut tick = tokio::time::interval(interval);
        tick.tick().await; // the first tick fires immediately; consume it
        loop {
            tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    let bytes = {
                        let guard = checkpoint.lock().expect("checkpoint lock poisoned");
                        guard.to_bytes()?
                    };
                    if let Err(err) = checkpointer.write(Some(&bytes)).await {
                        warn!(%err, "periodic checkpoint write failed, aborting run");
                        abort.cancel();
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Rehydrate a new execution from a persisted checkpoint and run it.
    pub async fn resume(
        registry: Arc<ActionRegistry<K>>,
        checkpointer: Arc<dyn Checkpointer>,
        config: ExecutorConfig,
    ) -> Result<(), ExecutorError> {
        let blob = checkpointer
            .read()
            .await?
            .ok_or(ExecutorError::NoCheckpointToResume)?;
        let checkpoint = Checkpoint::from_bytes(&blob)?;

        let mut runner = TaskRunner::new(config.max_cpu_intensive_tasks);
        let checkpoint = Arc::new(Mutex::new(checkpoint));
        let len = checkpoint.lock().expect("checkpoint lock poisoned").actions.len();

        for index in 0..len {
            let (action_type, json_action, completed) = {
                let guard = checkpoint.lock().expect("checkpoint lock poisoned");
                let entry = &guard.actions[index];
                (entry.action_type.clone(), entry.json_action.clone(), entry.completed)
            };
            let action_type_descriptor = registry.lookup(&action_type)?.clone();
            let mut action = action_type_descriptor.empty_action();
            action.from_json(&json_action)?;
            let key = action.action_key();
            let task_id: TaskId<K> = (action_type, key);

            if completed {
                runner.add_completed_task(task_id)?;
            } else {
                let checkpoint = Arc::clone(&checkpoint);
                let on_finish = move || {
                    checkpoint
                        .lock()
                        .expect("checkpoint lock poisoned")
                        .actions[index]
                        .completed = true;
                };
                runner.add_task(
                    action_type_descriptor.is_cpu_intensive(),
                    task_id,
                    action,
                    on_finish,
                )?;
            }
        }

        let execution = Execution {
            registry,
            checkpointer: Some(checkpointer),
            checkpoint,
            runner,
            config,
        };
        execution.run().await
    }
}
