//! Tests for the persistent task queue and its worker contract

use crate::queue::{QueueError, TaskQueue};
use crate::tests::common::create_rig;
use shared::config::Parameter;
use shared::task::TaskKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

#[tokio::test]
async fn test_add_makes_task_visible_in_fifo_order() {
    let rig = create_rig().await;
    let queue = &rig.state.queue;

    queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap();
    queue.add(TaskKind::Test(Parameter::Alk)).await.unwrap();
    queue.add(TaskKind::Flush(Parameter::Mg)).await.unwrap();

    let order: Vec<TaskKind> = queue
        .list()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.param)
        .collect();
    assert_eq!(
        order,
        vec![
            TaskKind::Test(Parameter::Ca),
            TaskKind::Test(Parameter::Alk),
            TaskKind::Flush(Parameter::Mg),
        ]
    );
}

#[tokio::test]
async fn test_add_rejects_queued_duplicate() {
    let rig = create_rig().await;
    let queue = &rig.state.queue;

    queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap();
    let err = queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateQueued));

    // A different task kind for the same analyte is a different param.
    queue.add(TaskKind::Flush(Parameter::Ca)).await.unwrap();
}

#[tokio::test]
async fn test_cancel_then_cancel_again_reports_not_found() {
    let rig = create_rig().await;
    let queue = &rig.state.queue;

    queue.add(TaskKind::Test(Parameter::No3)).await.unwrap();
    queue.cancel(TaskKind::Test(Parameter::No3)).await.unwrap();

    let err = queue
        .cancel(TaskKind::Test(Parameter::No3))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::NotFound));
    assert!(queue.list().await.unwrap().is_empty());
}

/// Runs the worker with a callback that parks each task until released,
/// so tests can observe the in-flight state.
fn spawn_parking_worker(
    queue: TaskQueue,
    started: mpsc::Sender<TaskKind>,
    release: Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        queue
            .run(move |task| {
                let started = started.clone();
                let release = release.clone();
                async move {
                    let _ = started.send(task.param).await;
                    release.notified().await;
                }
            })
            .await;
    })
}

#[tokio::test]
async fn test_running_task_blocks_duplicates_and_cancel() {
    let rig = create_rig().await;
    let queue = rig.state.queue.clone();
    let (started_tx, mut started_rx) = mpsc::channel(8);
    let release = Arc::new(Notify::new());
    let _worker = spawn_parking_worker(queue.clone(), started_tx, release.clone());

    queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap();
    let running = started_rx.recv().await.unwrap();
    assert_eq!(running, TaskKind::Test(Parameter::Ca));
    assert_eq!(queue.current_kind().await, Some(TaskKind::Test(Parameter::Ca)));

    // The in-flight task is no longer in the persisted queue...
    assert!(queue.list().await.unwrap().is_empty());
    // ...but still blocks duplicates and cancellation.
    let err = queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap_err();
    assert!(matches!(err, QueueError::DuplicateInProgress));
    let err = queue
        .cancel(TaskKind::Test(Parameter::Ca))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyRunning));

    // Other params enqueue freely while one runs.
    queue.add(TaskKind::Test(Parameter::Alk)).await.unwrap();

    release.notify_one();
    let next = started_rx.recv().await.unwrap();
    assert_eq!(next, TaskKind::Test(Parameter::Alk));
    release.notify_one();
}

#[tokio::test]
async fn test_worker_executes_in_enqueue_order() {
    let rig = create_rig().await;
    let queue = rig.state.queue.clone();

    queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap();
    queue.add(TaskKind::Test(Parameter::Alk)).await.unwrap();
    queue.add(TaskKind::Test(Parameter::Mg)).await.unwrap();

    let executed = Arc::new(Mutex::new(Vec::new()));
    let worker_queue = queue.clone();
    let executed_by_worker = Arc::clone(&executed);
    let _worker = tokio::spawn(async move {
        worker_queue
            .run(move |task| {
                let executed = Arc::clone(&executed_by_worker);
                async move {
                    executed.lock().await.push(task.param);
                }
            })
            .await;
    });

    for _ in 0..1000 {
        if executed.lock().await.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(
        *executed.lock().await,
        vec![
            TaskKind::Test(Parameter::Ca),
            TaskKind::Test(Parameter::Alk),
            TaskKind::Test(Parameter::Mg),
        ]
    );
    assert!(queue.is_idle().await.unwrap());
}

#[tokio::test]
async fn test_worker_drains_tasks_persisted_before_start() {
    let rig = create_rig().await;
    let queue = rig.state.queue.clone();

    // Simulate a restart: tasks already in the bucket, no wake ever sent.
    {
        let mut database = rig.state.database.lock().await;
        database
            .enqueue_task(TaskKind::Test(Parameter::Po4), 1)
            .await
            .unwrap();
        database
            .enqueue_task(TaskKind::Flush(Parameter::Po4), 2)
            .await
            .unwrap();
    }

    let executed = Arc::new(Mutex::new(Vec::new()));
    let worker_queue = queue.clone();
    let executed_by_worker = Arc::clone(&executed);
    let _worker = tokio::spawn(async move {
        worker_queue
            .run(move |task| {
                let executed = Arc::clone(&executed_by_worker);
                async move {
                    executed.lock().await.push(task.param);
                }
            })
            .await;
    });

    for _ in 0..1000 {
        if executed.lock().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    assert_eq!(
        *executed.lock().await,
        vec![
            TaskKind::Test(Parameter::Po4),
            TaskKind::Flush(Parameter::Po4),
        ]
    );
}

#[tokio::test]
async fn test_cancelled_task_never_executes() {
    let rig = create_rig().await;
    let queue = rig.state.queue.clone();

    queue.add(TaskKind::Test(Parameter::Ca)).await.unwrap();
    queue.add(TaskKind::Test(Parameter::Alk)).await.unwrap();
    queue.cancel(TaskKind::Test(Parameter::Ca)).await.unwrap();

    let executed = Arc::new(Mutex::new(Vec::new()));
    let worker_queue = queue.clone();
    let executed_by_worker = Arc::clone(&executed);
    let _worker = tokio::spawn(async move {
        worker_queue
            .run(move |task| {
                let executed = Arc::clone(&executed_by_worker);
                async move {
                    executed.lock().await.push(task.param);
                }
            })
            .await;
    });

    for _ in 0..1000 {
        if executed.lock().await.len() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(*executed.lock().await, vec![TaskKind::Test(Parameter::Alk)]);
}
