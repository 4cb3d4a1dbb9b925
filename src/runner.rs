//! The dependency-respecting, CPU-gated task scheduler.
//!
//! A [`TaskRunner`] owns the task graph for one run: it admits tasks
//! ahead of time via [`TaskRunner::add_task`]/[`TaskRunner::add_completed_task`],
//! then [`TaskRunner::run`] drives every pending task to completion honoring
//! both the dependency partial order and a bounded pool of CPU-intensive
//! concurrency tokens.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::action::{format_task_id, Action, ActionKeyBound, TaskId};
use crate::error::{ExecutorError, MultiError, TaskFailure};

/// A one-shot completion event: raised at most once, observable by any
/// number of independent awaiters, including ones that start watching
/// after it has already fired.
#[derive(Debug)]
struct CompletionSignal {
    tx: watch::Sender<bool>,
}

impl CompletionSignal {
    fn new(already_raised: bool) -> Self {
        let (tx, _rx) = watch::channel(already_raised);
        Self { tx }
    }

    fn raise(&self) {
        // `send` only errors when every receiver has been dropped, which is
        // harmless here — nothing is left to observe the signal.
        let _ = self.tx.send(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

type OnFinish = Box<dyn Fn() + Send + Sync>;

struct TaskEntry<K: ActionKeyBound> {
    is_cpu_intensive: bool,
    /// `None` for a pre-completed sentinel registered via
    /// [`TaskRunner::add_completed_task`].
    action: Option<Box<dyn Action<K>>>,
    completed: CompletionSignal,
    on_finish: Option<OnFinish>,
}

/// Owns the task graph, the CPU-token semaphore, and drives tasks to
/// completion for a single run.
pub struct TaskRunner<K: ActionKeyBound> {
    max_cpu_intensive_tasks: NonZeroUsize,
    tasks: HashMap<TaskId<K>, Arc<TaskEntry<K>>>,
    order: Vec<TaskId<K>>,
}

impl<K: ActionKeyBound> std::fmt::Debug for TaskRunner<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner")
            .field("max_cpu_intensive_tasks", &self.max_cpu_intensive_tasks)
            .field("tasks", &self.order.len())
            .finish()
    }
}

impl<K: ActionKeyBound> TaskRunner<K> {
    pub fn new(max_cpu_intensive_tasks: NonZeroUsize) -> Self {
        Self {
            max_cpu_intensive_tasks,
            tasks: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Register `id` as already done. Fails if `id` is already present.
    pub fn add_completed_task(&mut self, id: TaskId<K>) -> Result<(), ExecutorError> {
        if self.tasks.contains_key(&id) {
            return Err(ExecutorError::DuplicateTask(format_task_id(&id)));
        }
        let entry = TaskEntry {
            is_cpu_intensive: false,
            action: None,
            completed: CompletionSignal::new(true),
            on_finish: None,
        };
        self.order.push(id.clone());
        self.tasks.insert(id, Arc::new(entry));
        Ok(())
    }

    /// Register `id` with a pending task. Fails if `id` is a duplicate or
    /// any declared dependency has not already been added.
    pub fn add_task(
        &mut self,
        is_cpu_intensive: bool,
        id: TaskId<K>,
        action: Box<dyn Action<K>>,
        on_finish: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), ExecutorError> {
        if self.tasks.contains_key(&id) {
            return Err(ExecutorError::DuplicateTask(format_task_id(&id)));
        }
        for dep in action.dependencies() {
            let dep_id = dep.task_id();
            if !self.tasks.contains_key(&dep_id) {
                return Err(ExecutorError::MissingDependency(
                    format_task_id(&id),
                    format_task_id(&dep_id),
                ));
            }
        }
        let entry = TaskEntry {
            is_cpu_intensive,
            action: Some(action),
            completed: CompletionSignal::new(false),
            on_finish: Some(Box::new(on_finish)),
        };
        self.order.push(id.clone());
        self.tasks.insert(id, Arc::new(entry));
        Ok(())
    }

    /// Number of tasks registered so far (completed or pending).
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Drive every registered non-completed task to completion or
    /// cancellation. Returns an aggregated error if any task's `execute`
    /// failed; `abort` is shared with the caller so an external event
    /// (such as a failed periodic checkpoint write) can cancel the run too.
    pub async fn run(&self, abort: CancellationToken) -> Result<(), ExecutorError> {
        let tasks = Arc::new(self.tasks.clone());
        let order = Arc::new(self.order.clone());
        let cpu_tokens = Arc::new(Semaphore::new(self.max_cpu_intensive_tasks.get()));

        let (tx, mut rx) = mpsc::channel::<TaskId<K>>(order.len().max(1));
        let dispatch_abort = abort.clone();
        let dispatch_order = Arc::clone(&order);
        let dispatch_tasks = Arc::clone(&tasks);
        tokio::spawn(async move {
            Self::dispatch(dispatch_order, dispatch_tasks, tx, dispatch_abort).await;
        });

        let mut join_set: JoinSet<Result<(), TaskFailure>> = JoinSet::new();
        let mut failures = Vec::new();
        let mut channel_closed = false;

        loop {
            if channel_closed && join_set.is_empty() {
                break;
            }
            tokio::select! {
                maybe_id = rx.recv(), if !channel_closed => {
                    match maybe_id {
                        Some(task_id) => {
                            let tasks = Arc::clone(&tasks);
                            let abort = abort.clone();
                            let cpu_tokens = Arc::clone(&cpu_tokens);
                            join_set.spawn(Self::run_task(task_id, tasks, abort, cpu_tokens));
                        }
                        None => channel_closed = true,
                    }
                }
                Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                    let outcome = joined.expect("task worker panicked");
                    if let Err(failure) = outcome {
                        warn!(task = %failure.task, error = %failure.error, "task failed, aborting run");
                        failures.push(failure);
                        abort.cancel();
                    }
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecutorError::Execution(MultiError(failures)))
        }
    }

    async fn dispatch(
        order: Arc<Vec<TaskId<K>>>,
        tasks: Arc<HashMap<TaskId<K>, Arc<TaskEntry<K>>>>,
        tx: mpsc::Sender<TaskId<K>>,
        abort: CancellationToken,
    ) {
        for id in order.iter() {
            // Pre-completed sentinels are never dispatched for execution:
            // their signal is already raised.
            let Some(entry) = tasks.get(id) else {
                continue;
            };
            if entry.action.is_none() {
                continue;
            }
            tokio::select! {
                _ = abort.cancelled() => {
                    debug!("dispatch aborted mid-iteration");
                    return;
                }
                send_result = tx.send(id.clone()) => {
                    if send_result.is_err() {
                        return;
                    }
                }
            }
        }
        // Dropping `tx` here closes the work channel once every pending
        // task has been offered.
    }

    async fn run_task(
        task_id: TaskId<K>,
        tasks: Arc<HashMap<TaskId<K>, Arc<TaskEntry<K>>>>,
        abort: CancellationToken,
        cpu_tokens: Arc<Semaphore>,
    ) -> Result<(), TaskFailure> {
        let entry = tasks
            .get(&task_id)
            .cloned()
            .expect("dispatched a task id that isn't registered");

        if abort.is_cancelled() {
            return Ok(());
        }

        let action = entry
            .action
            .as_ref()
            .expect("dispatched a pre-completed sentinel for execution");

        for dep in action.dependencies() {
            let dep_id = dep.task_id();
            let dep_entry = tasks
                .get(&dep_id)
                .expect("dependency validated present at add_task time");
            tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                _ = dep_entry.completed.wait() => {}
            }
        }

        let _permit = if entry.is_cpu_intensive {
            tokio::select! {
                _ = abort.cancelled() => return Ok(()),
                permit = cpu_tokens.acquire() => {
                    Some(permit.expect("cpu token semaphore should never be closed"))
                }
            }
        } else {
            None
        };

        match action.execute().await {
            Ok(()) => {
                if let Some(on_finish) = &entry.on_finish {
                    on_finish();
                }
                entry.completed.raise();
                Ok(())
            }
            Err(error) => Err(TaskFailure {
                task: format_task_id(&task_id),
                error,
            }),
        }
        // `_permit` is dropped here, releasing the CPU token unconditionally
        // after `execute` (success or failure) — it was never acquired on
        // the abort-before-acquire path, so nothing is released there.
    }
}
