//! Schedule supervision
//!
//! Owns one cancellable recurrence schedule per parameter and reconciles
//! the running set against the configuration record: schedules start when a
//! parameter is enabled with a non-empty rule, stop when it is disabled or
//! its rule is removed, and restart when the rule text changes. A schedule
//! whose rule is untouched keeps running, anchor and all.

use chrono::Utc;
use shared::config::{AnalyzerConfig, Parameter};
use shared::task::TaskKind;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::activity::ActivityLog;
use crate::database::ControllerDatabase;
use crate::queue::{QueueError, TaskQueue};
use crate::recurrence::{run_schedule, Rule};

/// Bookkeeping for one live schedule.
struct RunningSchedule {
    /// Rule text the schedule was started with, for change detection
    rule_text: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle to the supervisor. Cheap to clone.
#[derive(Clone)]
pub struct ScheduleSupervisor {
    schedules: Arc<Mutex<HashMap<Parameter, RunningSchedule>>>,
    /// Parent of every schedule token; cancelled on shutdown
    root: CancellationToken,
    queue: TaskQueue,
    database: Arc<Mutex<ControllerDatabase>>,
    activity: ActivityLog,
}

impl ScheduleSupervisor {
    pub fn new(
        queue: TaskQueue,
        database: Arc<Mutex<ControllerDatabase>>,
        activity: ActivityLog,
    ) -> Self {
        Self {
            schedules: Arc::new(Mutex::new(HashMap::new())),
            root: CancellationToken::new(),
            queue,
            database,
            activity,
        }
    }

    /// Bring the running schedules in line with a configuration record.
    /// Called once at startup and after every configuration write.
    pub async fn reconcile(&self, config: &AnalyzerConfig) {
        let mut schedules = self.schedules.lock().await;

        for p in Parameter::ALL {
            let pc = config.parameter(p);
            let desired = (pc.enable && !pc.schedule.is_empty()).then(|| pc.schedule.clone());

            if schedules.get(&p).map(|s| s.rule_text.clone()) == desired {
                continue;
            }

            if let Some(running) = schedules.remove(&p) {
                info!(parameter = %p, "Stopping schedule");
                running.token.cancel();
                running.handle.abort();
            }

            let Some(rule_text) = desired else { continue };

            // The rule is anchored at the moment the schedule starts.
            match Rule::parse(&rule_text, Utc::now()) {
                Ok(rule) => {
                    info!(parameter = %p, rule = %rule_text, "Starting schedule");
                    let token = self.root.child_token();
                    let fire = {
                        let queue = self.queue.clone();
                        let database = self.database.clone();
                        let activity = self.activity.clone();
                        move || {
                            scheduled_fire(p, queue.clone(), database.clone(), activity.clone())
                        }
                    };
                    let handle = tokio::spawn(run_schedule(rule, token.clone(), fire));
                    schedules.insert(
                        p,
                        RunningSchedule {
                            rule_text,
                            token,
                            handle,
                        },
                    );
                }
                Err(e) => {
                    // PUT /config validates rules, but a record written by
                    // an older build can still carry one that no longer
                    // parses.
                    warn!(parameter = %p, error = %e, "Ignoring unparseable schedule rule");
                    self.activity
                        .append(format!("{}: schedule rule rejected ({})", p.label(), e))
                        .await;
                }
            }
        }
    }

    /// Parameters with a live schedule, sorted.
    pub async fn active_parameters(&self) -> Vec<Parameter> {
        let schedules = self.schedules.lock().await;
        let mut active: Vec<Parameter> = schedules.keys().copied().collect();
        active.sort();
        active
    }

    /// Stop every schedule promptly.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let mut schedules = self.schedules.lock().await;
        for (_, running) in schedules.drain() {
            running.handle.abort();
        }
    }
}

/// One scheduler fire: re-check admissibility against the current
/// configuration, then enqueue the test. Skips become activity log lines,
/// never user-facing errors.
pub(crate) async fn scheduled_fire(
    p: Parameter,
    queue: TaskQueue,
    database: Arc<Mutex<ControllerDatabase>>,
    activity: ActivityLog,
) {
    let config = {
        let mut database = database.lock().await;
        match database.load_config().await {
            Ok(config) => config,
            Err(e) => {
                error!(parameter = %p, "Failed to load configuration for scheduled test: {:#}", e);
                return;
            }
        }
    };

    if let Err(reason) = config.test_admissible(p) {
        activity
            .append(format!(
                "{}: scheduled test skipped ({})",
                p.label(),
                reason
            ))
            .await;
        return;
    }

    match queue.add(TaskKind::Test(p)).await {
        Ok(_) => {}
        Err(QueueError::DuplicateInProgress) | Err(QueueError::DuplicateQueued) => {
            activity
                .append(format!(
                    "{}: scheduled test skipped (duplicate in progress)",
                    p.label()
                ))
                .await;
        }
        Err(e) => {
            error!(parameter = %p, "Failed to enqueue scheduled test: {}", e);
        }
    }
}
