//! Shared fixtures for the controller tests
//!
//! A test rig is the full wiring of the daemon — store, simulated analyzer,
//! queue, executor, supervisor, API state — on a temp directory, with the
//! timing knobs turned down so polls resolve in milliseconds.

use crate::activity::ActivityLog;
use crate::api::AppState;
use crate::bus::{self, SimulatedAnalyzer};
use crate::database::ControllerDatabase;
use crate::device::Device;
use crate::executor::TaskExecutor;
use crate::queue::TaskQueue;
use crate::reconfigure::ScheduleSupervisor;
use shared::config::AnalyzerConfig;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub struct TestRig {
    pub state: AppState,
    pub sim: SimulatedAnalyzer,
    pub executor: TaskExecutor,
    /// Keeps the store directory alive for the duration of the test
    pub _temp_dir: TempDir,
}

pub async fn create_rig() -> TestRig {
    let temp_dir = TempDir::new().unwrap();
    let mut database = ControllerDatabase::new(temp_dir.path(), 5).unwrap();
    database.initialize().await.unwrap();
    // Seed the default configuration record.
    database.load_config().await.unwrap();
    let database = Arc::new(Mutex::new(database));

    let sim = SimulatedAnalyzer::new();
    sim.set_busy_polls(1);
    let device = Device::new(
        bus::shared(sim.clone()),
        Duration::from_millis(1),
        Duration::from_secs(5),
    );
    let activity = ActivityLog::new(100);
    let accounting = Arc::new(Mutex::new(()));
    let queue = TaskQueue::new(Arc::clone(&database));
    let executor = TaskExecutor::new(
        Arc::clone(&database),
        device.clone(),
        activity.clone(),
        Arc::clone(&accounting),
        Duration::from_millis(1),
    );
    let supervisor = ScheduleSupervisor::new(queue.clone(), Arc::clone(&database), activity.clone());

    TestRig {
        state: AppState {
            database,
            queue,
            device,
            activity,
            supervisor,
            accounting,
        },
        sim,
        executor,
        _temp_dir: temp_dir,
    }
}

/// Replace the rig's analyzer configuration record.
pub async fn store_config(rig: &TestRig, config: &AnalyzerConfig) {
    let mut database = rig.state.database.lock().await;
    database.store_config(config).await.unwrap();
}

/// Load the rig's analyzer configuration record.
pub async fn load_config(rig: &TestRig) -> AnalyzerConfig {
    let mut database = rig.state.database.lock().await;
    database.load_config().await.unwrap()
}

/// Spawn the single queue worker over the rig's executor, as main does.
pub fn spawn_worker(rig: &TestRig) -> tokio::task::JoinHandle<()> {
    let queue = rig.state.queue.clone();
    let executor = rig.executor.clone();
    tokio::spawn(async move {
        queue
            .run(move |task| {
                let executor = executor.clone();
                async move {
                    let _ = executor.execute(&task).await;
                }
            })
            .await;
    })
}

/// Wait until nothing is queued and nothing is running.
pub async fn wait_until_idle(rig: &TestRig) {
    for _ in 0..1000 {
        if rig.state.queue.is_idle().await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("queue did not drain in time");
}
