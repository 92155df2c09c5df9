//! Persistent task queue with a single worker
//!
//! Every physical interaction with the analyzer is funneled through this
//! queue: scheduler fires and HTTP handlers enqueue, and exactly one worker
//! drains tasks in FIFO order. The bucket in the store is the authoritative
//! queue — it survives restarts — while a `Notify` acts purely as a wake
//! signal for the worker.
//
// Locking order: the database mutex first, then the `current` slot. `add`
// and `cancel` hold the database lock across the dedup check and the
// mutation, and the worker holds it across pop-and-mark-current, so the
// one-task-per-param invariant cannot be raced.

use shared::task::{Task, TaskKind};
use shared::utils::current_timestamp;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error};

use crate::database::ControllerDatabase;

/// Queue operation failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("a task for this parameter is already running")]
    DuplicateInProgress,

    #[error("a task for this parameter is already queued")]
    DuplicateQueued,

    #[error("no queued task for this parameter")]
    NotFound,

    #[error("the task is already running and cannot be cancelled")]
    AlreadyRunning,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Handle to the shared task queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    database: Arc<Mutex<ControllerDatabase>>,
    current: Arc<Mutex<Option<Task>>>,
    wake: Arc<Notify>,
}

impl TaskQueue {
    pub fn new(database: Arc<Mutex<ControllerDatabase>>) -> Self {
        Self {
            database,
            current: Arc::new(Mutex::new(None)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a task and wake the worker.
    ///
    /// Fails with [`QueueError::DuplicateInProgress`] when a task with the
    /// same param is executing, and [`QueueError::DuplicateQueued`] when
    /// one is already persisted. Once `add` returns success the task is
    /// visible to [`list`](Self::list) and will execute in FIFO order.
    pub async fn add(&self, kind: TaskKind) -> Result<Task, QueueError> {
        let mut database = self.database.lock().await;

        if self.current_kind().await == Some(kind) {
            return Err(QueueError::DuplicateInProgress);
        }
        if database.find_queued_task(kind).await?.is_some() {
            return Err(QueueError::DuplicateQueued);
        }

        let task = database.enqueue_task(kind, current_timestamp()).await?;
        debug!(param = %kind, id = task.id, "Task enqueued");

        self.wake.notify_one();
        Ok(task)
    }

    /// Cancel the queued task for a param.
    ///
    /// Succeeding before dequeue guarantees the task will not execute.
    /// The running task cannot be cancelled.
    pub async fn cancel(&self, kind: TaskKind) -> Result<(), QueueError> {
        let mut database = self.database.lock().await;

        if self.current_kind().await == Some(kind) {
            return Err(QueueError::AlreadyRunning);
        }
        if !database.remove_queued_task(kind).await? {
            return Err(QueueError::NotFound);
        }

        debug!(param = %kind, "Queued task cancelled");
        Ok(())
    }

    /// All persisted tasks, ascending by enqueue time (ties by key).
    pub async fn list(&self) -> Result<Vec<Task>, QueueError> {
        let mut database = self.database.lock().await;
        Ok(database.list_queued_tasks().await?)
    }

    /// The param of the task currently executing, if any.
    pub async fn current_kind(&self) -> Option<TaskKind> {
        self.current.lock().await.as_ref().map(|t| t.param)
    }

    /// Whether nothing is queued and nothing is running. The calibration
    /// endpoints gate on this.
    pub async fn is_idle(&self) -> Result<bool, QueueError> {
        let mut database = self.database.lock().await;
        Ok(database.queue_is_empty().await? && self.current_kind().await.is_none())
    }

    /// Drain the queue forever, executing one task at a time.
    ///
    /// The worker callback is invoked without any queue lock held and never
    /// concurrently with itself. While it runs, the task is held in memory
    /// as `current` and is no longer present in the bucket.
    pub async fn run<F, Fut>(&self, mut worker: F)
    where
        F: FnMut(Task) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            let next = {
                let mut database = self.database.lock().await;
                match database.pop_next_task().await {
                    Ok(Some(task)) => {
                        // Mark the task current before the lock is released
                        // so dedup can never miss it.
                        *self.current.lock().await = Some(task.clone());
                        Ok(Some(task))
                    }
                    other => other,
                }
            };

            match next {
                Ok(Some(task)) => {
                    worker(task).await;
                    *self.current.lock().await = None;
                }
                Ok(None) => self.wake.notified().await,
                Err(e) => {
                    error!("Failed to scan task queue: {:#}", e);
                    // Back off instead of spinning on a broken store.
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}
