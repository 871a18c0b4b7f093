//! Task execution layer.
//!
//! `submit` commits the task to the store before returning its id, then
//! queues the id for the worker pool. The store is the source of truth:
//! the queue only carries ids, and a worker re-reads the record before it
//! claims the task, so stale or duplicate queue entries are harmless.
//!
//! A worker takes the device's execution lock without waiting. A busy
//! device puts the task back on the queue after `contention_delay`; a
//! retryable failure puts it back after the retry policy's backoff. Every
//! other failure is final.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use microlab_core::error_recovery::RetryPolicy;
use microlab_core::{ErrorClass, LabError, LabResult};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TaskConfig;
use crate::operations::OperationContext;
use crate::store::TaskDb;
use crate::task::{TaskError, TaskId, TaskRecord, TaskState, TaskStatus};

/// Upper bound between status re-checks in [`TaskExecutor::wait`].
const WAIT_RECHECK: Duration = Duration::from_millis(250);

// =============================================================================
// Task Executor
// =============================================================================

/// Cloning shares the executor.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

struct Inner {
    db: TaskDb,
    ops: OperationContext,
    retry: RetryPolicy,
    contention_delay: Duration,
    max_contention_retries: u32,
    workers: usize,
    queue_tx: mpsc::UnboundedSender<TaskId>,
    queue_rx: Mutex<mpsc::UnboundedReceiver<TaskId>>,
    /// Task id to device id, for tasks a worker is executing.
    in_flight: DashMap<TaskId, String>,
    changed: Notify,
}

/// What a worker did with one queue entry.
enum Claim {
    Run(TaskRecord),
    Skip,
}

impl TaskExecutor {
    /// Wrap `db` and queue every unfinished task it holds.
    ///
    /// Tasks left `running` by a previous process go back to `pending`.
    pub fn new(db: TaskDb, ops: OperationContext, config: &TaskConfig) -> LabResult<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let executor = Self {
            inner: Arc::new(Inner {
                db,
                ops,
                retry: config.retry_policy(),
                contention_delay: config.contention_delay(),
                max_contention_retries: config.max_contention_retries,
                workers: config.workers.max(1),
                queue_tx,
                queue_rx: Mutex::new(queue_rx),
                in_flight: DashMap::new(),
                changed: Notify::new(),
            }),
        };

        let recovered = executor.inner.db.recover()?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "re-enqueueing unfinished tasks");
        }
        for record in recovered {
            executor.enqueue(record.id);
        }
        Ok(executor)
    }

    /// Open the store named by `config` (in memory when none is set).
    pub fn open(ops: OperationContext, config: &TaskConfig) -> LabResult<Self> {
        let db = match &config.database {
            Some(path) => TaskDb::open(path)?,
            None => TaskDb::in_memory()?,
        };
        Self::new(db, ops.with_poll_interval(config.poll_interval()), config)
    }

    /// Spawn the worker pool. Workers stop after their current task once
    /// `shutdown` fires.
    pub fn start(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        info!(workers = self.inner.workers, "starting task workers");
        (0..self.inner.workers)
            .map(|worker| {
                let executor = self.clone();
                let shutdown = shutdown.subscribe();
                tokio::spawn(executor.worker(worker, shutdown))
            })
            .collect()
    }

    // =========================================================================
    // Submission Interface
    // =========================================================================

    /// Persist a new task and queue it. The id is returned only after the
    /// record is committed.
    pub fn submit(
        &self,
        device_id: impl Into<String>,
        operation: impl Into<String>,
        params: Value,
    ) -> LabResult<TaskId> {
        let record = TaskRecord::new(device_id, operation, params);
        self.inner.db.insert(&record)?;
        info!(
            task_id = %record.id,
            device_id = %record.device_id,
            operation = %record.operation,
            "task submitted"
        );
        self.enqueue(record.id);
        Ok(record.id)
    }

    pub fn status(&self, id: TaskId) -> LabResult<TaskStatus> {
        self.inner
            .db
            .get(id)?
            .map(|record| record.status())
            .ok_or_else(|| LabError::TaskNotFound(id.to_string()))
    }

    /// Every task in the store, oldest first.
    pub fn list(&self) -> LabResult<Vec<TaskStatus>> {
        Ok(self
            .inner
            .db
            .list_all()?
            .iter()
            .map(TaskStatus::from)
            .collect())
    }

    /// Cancel a task.
    ///
    /// A queued task fails with kind `cancelled`. A running task only gets
    /// `cancel_requested` set; hardware operations are not interrupted.
    /// Finished tasks are left alone.
    pub fn cancel(&self, id: TaskId) -> LabResult<TaskStatus> {
        let (record, ()) = self.inner.db.update(id, |record| match record.state {
            TaskState::Pending | TaskState::Retrying => record.fail(TaskError::from(
                &LabError::Cancelled("cancelled before it ran".to_string()),
            )),
            TaskState::Running => {
                record.cancel_requested = true;
                Ok(())
            }
            TaskState::Succeeded | TaskState::Failed => Ok(()),
        })?;
        info!(task_id = %id, state = %record.state, "task cancel requested");
        self.inner.changed.notify_waiters();
        Ok(record.status())
    }

    /// Wait until the task reaches a terminal state.
    pub async fn wait(&self, id: TaskId) -> LabResult<TaskStatus> {
        loop {
            let notified = self.inner.changed.notified();
            let status = self.status(id)?;
            if status.state.is_terminal() {
                return Ok(status);
            }
            let _ = tokio::time::timeout(WAIT_RECHECK, notified).await;
        }
    }

    /// Ids of the tasks being executed right now.
    pub fn in_flight(&self) -> Vec<TaskId> {
        self.inner.in_flight.iter().map(|e| *e.key()).collect()
    }

    pub fn operations(&self) -> &OperationContext {
        &self.inner.ops
    }

    // =========================================================================
    // Queue
    // =========================================================================

    fn enqueue(&self, id: TaskId) {
        // The receiver lives in `inner`, so sending cannot fail while we exist
        let _ = self.inner.queue_tx.send(id);
    }

    fn enqueue_after(&self, id: TaskId, delay: Duration) {
        let tx = self.inner.queue_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(id);
        });
    }

    async fn next(&self) -> Option<TaskId> {
        self.inner.queue_rx.lock().await.recv().await
    }

    // =========================================================================
    // Workers
    // =========================================================================

    async fn worker(self, worker: usize, mut shutdown: broadcast::Receiver<()>) {
        debug!(worker, "task worker started");
        loop {
            let id = tokio::select! {
                _ = shutdown.recv() => break,
                id = self.next() => match id {
                    Some(id) => id,
                    None => break,
                },
            };
            debug!(worker, task_id = %id, "dequeued task");
            if let Err(err) = self.process(id).await {
                warn!(worker, task_id = %id, error = %err, "task bookkeeping failed");
            }
            self.inner.changed.notify_waiters();
        }
        debug!(worker, "task worker stopped");
    }

    async fn process(&self, id: TaskId) -> LabResult<()> {
        let Some(record) = self.inner.db.get(id)? else {
            warn!(task_id = %id, "queued task is missing from the store");
            return Ok(());
        };
        if !matches!(record.state, TaskState::Pending | TaskState::Retrying) {
            // duplicate queue entry, or cancelled while waiting
            return Ok(());
        }

        let guard = match self.inner.ops.registry().locks().try_acquire(&record.device_id) {
            Ok(guard) => guard,
            Err(LabError::ResourceContention { .. }) => return self.on_contention(record),
            Err(err) => {
                // unknown device: nothing to lock, nothing to run
                return self.finish(id, Err(err));
            }
        };

        let record = match self.claim(id)? {
            Claim::Run(record) => record,
            Claim::Skip => return Ok(()),
        };

        self.inner.in_flight.insert(id, record.device_id.clone());
        let attempt = record.retries + 1;
        debug!(task_id = %id, device_id = %record.device_id, attempt, "executing task");

        let outcome = match self
            .inner
            .ops
            .parse(&record.device_id, &record.operation, &record.params)
        {
            Ok(op) => self.inner.ops.execute(&record.device_id, &op).await,
            Err(err) => Err(err),
        };

        let finished = self.finish(id, outcome);
        self.inner.in_flight.remove(&id);
        drop(guard);
        finished
    }

    /// Move a queued task to `running`, unless it was cancelled meanwhile.
    fn claim(&self, id: TaskId) -> LabResult<Claim> {
        let (record, claimed) = self.inner.db.update(id, |record| {
            if !matches!(record.state, TaskState::Pending | TaskState::Retrying) {
                return Ok(false);
            }
            record.transition(TaskState::Running)?;
            record.next_attempt_at = None;
            Ok(true)
        })?;
        Ok(if claimed { Claim::Run(record) } else { Claim::Skip })
    }

    fn on_contention(&self, record: TaskRecord) -> LabResult<()> {
        let id = record.id;
        let limit = self.inner.max_contention_retries;
        let (record, requeue) = self.inner.db.update(id, |record| {
            if !matches!(record.state, TaskState::Pending | TaskState::Retrying) {
                return Ok(false);
            }
            if record.contention_retries >= limit {
                let busy = LabError::ResourceContention {
                    device_id: record.device_id.clone(),
                };
                record.fail(TaskError::from(&busy))?;
                return Ok(false);
            }
            record.contention_retries += 1;
            Ok(true)
        })?;

        if requeue {
            debug!(
                task_id = %id,
                device_id = %record.device_id,
                contention_retries = record.contention_retries,
                "device busy, requeueing"
            );
            self.enqueue_after(id, self.inner.contention_delay);
        } else if record.state == TaskState::Failed {
            warn!(
                task_id = %id,
                device_id = %record.device_id,
                "task failed: device stayed busy"
            );
        }
        Ok(())
    }

    /// Record the outcome of an attempt.
    fn finish(&self, id: TaskId, outcome: Result<Value, LabError>) -> LabResult<()> {
        let retry = &self.inner.retry;
        match outcome {
            Ok(result) => {
                let (record, ()) = self.inner.db.update(id, |r| r.succeed(result))?;
                info!(
                    task_id = %id,
                    device_id = %record.device_id,
                    operation = %record.operation,
                    retries = record.retries,
                    "task succeeded"
                );
            }
            Err(err) if err.is_retryable() => {
                let error = TaskError::from(&err);
                let (record, backoff) = self.inner.db.update(id, |r| {
                    if r.state != TaskState::Running || !retry.should_retry(r.retries) {
                        r.fail(error.clone())?;
                        return Ok(None);
                    }
                    r.retries += 1;
                    let backoff = retry.backoff(r.retries);
                    r.transition(TaskState::Retrying)?;
                    r.error = Some(error.clone());
                    r.next_attempt_at = chrono::Duration::from_std(backoff)
                        .ok()
                        .map(|d| Utc::now() + d);
                    Ok(Some(backoff))
                })?;
                match backoff {
                    Some(backoff) => {
                        warn!(
                            task_id = %id,
                            device_id = %record.device_id,
                            attempt = record.retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %err,
                            "task attempt failed, retrying"
                        );
                        self.enqueue_after(id, backoff);
                    }
                    None => warn!(
                        task_id = %id,
                        device_id = %record.device_id,
                        retries = record.retries,
                        error = %err,
                        "task failed after retries"
                    ),
                }
            }
            Err(err) => {
                let (record, ()) = self.inner.db.update(id, |r| r.fail(TaskError::from(&err)))?;
                let kind = record.error.as_ref().map(|e| e.kind).unwrap_or(ErrorClass::Permanent);
                warn!(
                    task_id = %id,
                    device_id = %record.device_id,
                    kind = %kind,
                    error = %err,
                    "task failed"
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for TaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskExecutor")
            .field("workers", &self.inner.workers)
            .field("in_flight", &self.inner.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microlab_hardware::{DeviceRegistry, DriverCatalog, HardwareConfig};
    use serde_json::json;
    use tracing_test::traced_test;

    const LAB: &str = r#"
[[devices]]
id = "stirrer"
type = "stirrer"
implementation = "simulated"

[[devices]]
id = "flaky"
type = "stirrer"
implementation = "simulated"
[devices.parameters.faults]
fail_always = true
kind = "timeout"
"#;

    async fn executor() -> TaskExecutor {
        let config: HardwareConfig = toml::from_str(LAB).unwrap();
        let registry = DeviceRegistry::bring_up(&config, &DriverCatalog::with_builtin_drivers())
            .await
            .unwrap();
        let ops = OperationContext::new(Arc::new(registry));
        TaskExecutor::open(ops, &TaskConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn submitted_task_is_pending_until_workers_start() {
        let executor = executor().await;
        let id = executor
            .submit("stirrer", "set_running", json!({"running": true}))
            .unwrap();
        let status = executor.status(id).unwrap();
        assert_eq!(status.state, TaskState::Pending);
        assert_eq!(status.retries, 0);
    }

    #[tokio::test]
    async fn cancel_pending_task() {
        let executor = executor().await;
        let id = executor.submit("stirrer", "stir", json!({"time": 1})).unwrap();

        let status = executor.cancel(id).unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.error.unwrap().kind, ErrorClass::Cancelled);

        // a worker dequeuing it afterwards leaves it cancelled
        let (tx, _rx) = broadcast::channel(1);
        executor.start(&tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(executor.status(id).unwrap().error.unwrap().kind, ErrorClass::Cancelled);
    }

    #[tokio::test]
    async fn unknown_task_id() {
        let executor = executor().await;
        assert!(matches!(
            executor.status(uuid::Uuid::new_v4()),
            Err(LabError::TaskNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn transient_failures_are_logged_as_retries() {
        let executor = executor().await;
        let (tx, _rx) = broadcast::channel(1);
        executor.start(&tx);

        let id = executor
            .submit("flaky", "set_running", json!({"running": true}))
            .unwrap();
        let status = executor.wait(id).await.unwrap();

        assert_eq!(status.state, TaskState::Failed);
        assert_eq!(status.retries, 3);
        assert_eq!(status.error.unwrap().kind, ErrorClass::Transient);
        assert!(logs_contain("task attempt failed, retrying"));
        assert!(logs_contain("task failed after retries"));
    }
}
