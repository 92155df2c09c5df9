//! Tests for schedule supervision and the scheduled-fire path

use crate::reconfigure::scheduled_fire;
use crate::tests::common::{create_rig, load_config, store_config};
use shared::config::Parameter;
use shared::task::TaskKind;
use std::sync::Arc;

#[tokio::test]
async fn test_reconcile_starts_and_stops_schedules() {
    let rig = create_rig().await;
    let supervisor = &rig.state.supervisor;

    let mut config = load_config(&rig).await;
    config.ca.enable = true;
    config.ca.schedule = "FREQ=DAILY;BYHOUR=8".to_string();
    config.mg.enable = true;
    config.mg.schedule = "FREQ=WEEKLY".to_string();
    supervisor.reconcile(&config).await;
    assert_eq!(
        supervisor.active_parameters().await,
        vec![Parameter::Ca, Parameter::Mg]
    );

    // Disabling stops the schedule; an empty rule does too.
    config.ca.enable = false;
    config.mg.schedule = String::new();
    supervisor.reconcile(&config).await;
    assert!(supervisor.active_parameters().await.is_empty());
}

#[tokio::test]
async fn test_reconcile_restarts_on_rule_change_only() {
    let rig = create_rig().await;
    let supervisor = &rig.state.supervisor;

    let mut config = load_config(&rig).await;
    config.no3.enable = true;
    config.no3.schedule = "FREQ=DAILY;BYHOUR=8".to_string();
    supervisor.reconcile(&config).await;
    assert_eq!(supervisor.active_parameters().await, vec![Parameter::No3]);

    // Unrelated config writes leave the schedule running.
    config.waste_remaining_ml = 3.0;
    supervisor.reconcile(&config).await;
    assert_eq!(supervisor.active_parameters().await, vec![Parameter::No3]);

    // A rule change replaces it.
    config.no3.schedule = "FREQ=DAILY;BYHOUR=20".to_string();
    supervisor.reconcile(&config).await;
    assert_eq!(supervisor.active_parameters().await, vec![Parameter::No3]);
}

#[tokio::test]
async fn test_reconcile_rejects_unparseable_rule() {
    let rig = create_rig().await;
    let supervisor = &rig.state.supervisor;

    // A record written by an older build can carry a rule the parser no
    // longer accepts; it must not take the supervisor down.
    let mut config = load_config(&rig).await;
    config.po4.enable = true;
    config.po4.schedule = "FREQ=FORTNIGHTLY".to_string();
    supervisor.reconcile(&config).await;

    assert!(supervisor.active_parameters().await.is_empty());
    let log = rig.state.activity.recent().await;
    assert!(log
        .iter()
        .any(|e| e.message.starts_with("PO4: schedule rule rejected")));
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let rig = create_rig().await;
    let supervisor = &rig.state.supervisor;

    let mut config = load_config(&rig).await;
    config.ca.enable = true;
    config.ca.schedule = "FREQ=HOURLY".to_string();
    supervisor.reconcile(&config).await;

    supervisor.shutdown().await;
    assert!(supervisor.active_parameters().await.is_empty());
}

#[tokio::test]
async fn test_fire_enqueues_admissible_test() {
    let rig = create_rig().await;

    scheduled_fire(
        Parameter::Ca,
        rig.state.queue.clone(),
        Arc::clone(&rig.state.database),
        rig.state.activity.clone(),
    )
    .await;

    let tasks = rig.state.queue.list().await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].param, TaskKind::Test(Parameter::Ca));
}

#[tokio::test]
async fn test_fire_skips_inadmissible_test() {
    let rig = create_rig().await;

    let mut config = load_config(&rig).await;
    config.ca.reagent_use_ml = 2.0;
    config.ca.reagent_start_ml = 2.0;
    config.ca.reagent_remain_ml = 1.0;
    store_config(&rig, &config).await;

    scheduled_fire(
        Parameter::Ca,
        rig.state.queue.clone(),
        Arc::clone(&rig.state.database),
        rig.state.activity.clone(),
    )
    .await;

    assert!(rig.state.queue.list().await.unwrap().is_empty());
    let log = rig.state.activity.recent().await;
    assert!(log
        .iter()
        .any(|e| e.message == "CA: scheduled test skipped (reagent low)"));
}

#[tokio::test]
async fn test_fire_logs_duplicate_instead_of_failing() {
    let rig = create_rig().await;

    rig.state
        .queue
        .add(TaskKind::Test(Parameter::Ca))
        .await
        .unwrap();

    scheduled_fire(
        Parameter::Ca,
        rig.state.queue.clone(),
        Arc::clone(&rig.state.database),
        rig.state.activity.clone(),
    )
    .await;

    // Still exactly one queued task, and the skip is visible in the log.
    assert_eq!(rig.state.queue.list().await.unwrap().len(), 1);
    let log = rig.state.activity.recent().await;
    assert!(log
        .iter()
        .any(|e| e.message == "CA: scheduled test skipped (duplicate in progress)"));
}
