mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{StallingStore, TestEnv};
use fleet_common::{InstancePatch, InstanceStatus, SchedulerState, SetupStatus};
use fleet_orchestrator::discovery::{DiscoverySettings, EndpointDiscovery};
use fleet_orchestrator::lifecycle_monitor::{
    CheckOutcome, InstanceMonitorRegistry, MonitorSettings,
};
use fleet_orchestrator::recovery;
use fleet_orchestrator::store::RecordStore;

const INTERVAL: Duration = Duration::from_secs(30);

#[tokio::test(start_paused = true)]
async fn never_running_instance_is_abandoned_after_cap() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![8188], InstanceStatus::Launching)
        .await;
    let monitors = env.state.monitors.clone();

    monitors.schedule_monitoring(inst.id, None).await.unwrap();
    assert!(monitors.is_monitoring(inst.id));

    tokio::time::sleep(INTERVAL * 22).await;

    let got = env.instance(inst.id).await;
    assert_eq!(got.scheduler.checks_performed, 20);
    assert!(!got.scheduler.active);
    assert_eq!(got.status, InstanceStatus::Launching);
    assert_eq!(got.setup_status, SetupStatus::Pending);
    assert!(!monitors.is_monitoring(inst.id));
    assert_eq!(env.audit("INSTANCE_MONITOR_ABANDONED").await.len(), 1);
    assert!(env.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn ready_instance_stops_on_first_check() {
    let env = TestEnv::new();
    let mut inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Running)
        .await;
    inst.setup_status = SetupStatus::Ready;
    env.store.insert_instance(&inst).await.unwrap();

    env.state.monitors.schedule_monitoring(inst.id, None).await.unwrap();
    tokio::time::sleep(INTERVAL * 3).await;

    let got = env.instance(inst.id).await;
    assert_eq!(got.scheduler.checks_performed, 1);
    assert!(!got.scheduler.active);
    assert!(env.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn running_instance_triggers_setup_exactly_once() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Launching)
        .await;
    env.state.monitors.schedule_monitoring(inst.id, Some("corr-1")).await.unwrap();

    // Comes up between check 2 and 3.
    tokio::time::sleep(INTERVAL * 2 + Duration::from_secs(5)).await;
    env.store
        .update_instance(inst.id, &InstancePatch::default().status(InstanceStatus::Running))
        .await
        .unwrap();
    tokio::time::sleep(INTERVAL * 5).await;

    assert_eq!(env.executor.calls(), vec![inst.id]);
    let got = env.instance(inst.id).await;
    assert_eq!(got.setup_status, SetupStatus::Installing);
    assert_eq!(got.scheduler.checks_performed, 3);
    assert!(!got.scheduler.active);
    assert_eq!(env.audit("INSTANCE_SETUP_TRIGGERED").await.len(), 1);
    assert!(!env.state.monitors.is_monitoring(inst.id));
}

#[tokio::test(start_paused = true)]
async fn rescheduling_replaces_the_previous_monitor() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Launching)
        .await;
    let monitors = env.state.monitors.clone();

    monitors.schedule_monitoring(inst.id, None).await.unwrap();
    monitors.schedule_monitoring(inst.id, None).await.unwrap();
    assert_eq!(monitors.active_count(), 1);

    tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
    assert_eq!(env.instance(inst.id).await.scheduler.checks_performed, 1);
}

#[tokio::test(start_paused = true)]
async fn executor_failure_marks_setup_failed() {
    let env = TestEnv::new();
    env.executor.fail_next();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Running)
        .await;

    let outcome = env.state.monitors.check_once(inst.id).await.unwrap();
    assert_eq!(outcome, CheckOutcome::Failed);

    let got = env.instance(inst.id).await;
    assert_eq!(got.setup_status, SetupStatus::Failed);
    assert!(got
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("ssh key missing"));
}

#[tokio::test(start_paused = true)]
async fn lost_transition_does_not_trigger() {
    let env = TestEnv::new();
    let mut inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Running)
        .await;
    inst.setup_status = SetupStatus::Installing;
    env.store.insert_instance(&inst).await.unwrap();

    let outcome = env.state.monitors.check_once(inst.id).await.unwrap();
    assert_eq!(outcome, CheckOutcome::SetupRaced);
    assert!(env.executor.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn error_and_stopped_instances_end_monitoring() {
    let env = TestEnv::new();
    let broken = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Error)
        .await;
    let stopped = env
        .add_instance(Some("10.0.0.10"), vec![], InstanceStatus::Stopped)
        .await;

    let monitors = &env.state.monitors;
    assert_eq!(monitors.check_once(broken.id).await.unwrap(), CheckOutcome::Failed);
    assert_eq!(monitors.check_once(stopped.id).await.unwrap(), CheckOutcome::Stopped);
    assert!(!env.instance(broken.id).await.scheduler.active);
    assert_eq!(env.instance(broken.id).await.status, InstanceStatus::Error);
}

#[tokio::test(start_paused = true)]
async fn stop_monitoring_cancels_checks() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Launching)
        .await;
    let monitors = env.state.monitors.clone();

    monitors.schedule_monitoring(inst.id, None).await.unwrap();
    assert!(monitors.get_monitoring_status(inst.id).await.unwrap().active);
    assert!(monitors.stop_monitoring(inst.id).await.unwrap());

    tokio::time::sleep(INTERVAL * 3).await;
    let status = monitors.get_monitoring_status(inst.id).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.checks_performed, 0);
    assert!(!monitors.stop_monitoring(inst.id).await.unwrap());
}

#[tokio::test]
async fn unknown_instance_is_not_found() {
    let env = TestEnv::new();
    let err = env
        .state
        .monitors
        .schedule_monitoring(uuid::Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert_eq!(
        env.state.monitors.check_once(uuid::Uuid::new_v4()).await.unwrap(),
        CheckOutcome::Missing
    );
}

fn stalling_registry(env: &TestEnv) -> (Arc<StallingStore>, Arc<InstanceMonitorRegistry>) {
    let store = Arc::new(StallingStore::new(env.store.clone()));
    let discovery = Arc::new(EndpointDiscovery::new(
        env.remote.clone(),
        DiscoverySettings::default(),
    ));
    let monitors = Arc::new(InstanceMonitorRegistry::new(
        store.clone(),
        env.executor.clone(),
        discovery,
        MonitorSettings::default(),
    ));
    (store, monitors)
}

#[tokio::test(start_paused = true)]
async fn stop_during_slow_check_keeps_flag_cleared() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Running)
        .await;
    let (store, monitors) = stalling_registry(&env);
    monitors.schedule_monitoring(inst.id, None).await.unwrap();

    // check #1 reads at t=30s and is still busy when the stop lands
    store.stall_next_read(Duration::from_secs(2));
    tokio::time::sleep(INTERVAL + Duration::from_millis(500)).await;
    assert!(monitors.stop_monitoring(inst.id).await.unwrap());

    tokio::time::sleep(INTERVAL * 4).await;
    let got = env.instance(inst.id).await;
    assert!(!got.scheduler.active);
    assert_eq!(got.scheduler.checks_performed, 0);
    assert_eq!(got.setup_status, SetupStatus::Pending);
    assert!(env.executor.calls().is_empty());
    assert!(!monitors.is_monitoring(inst.id));
    assert!(env.store.list_monitored_instances().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn check_racing_a_stop_is_dropped() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Launching)
        .await;
    let (store, monitors) = stalling_registry(&env);
    monitors.schedule_monitoring(inst.id, None).await.unwrap();

    store.stall_next_read(Duration::from_secs(2));
    let checker = monitors.clone();
    let id = inst.id;
    let check = tokio::spawn(async move { checker.check_once(id).await });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(monitors.stop_monitoring(inst.id).await.unwrap());

    assert_eq!(check.await.unwrap().unwrap(), CheckOutcome::Cancelled);
    let status = monitors.get_monitoring_status(inst.id).await.unwrap();
    assert!(!status.active);
    assert_eq!(status.checks_performed, 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_keeps_the_check_budget() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.9"), vec![], InstanceStatus::Launching)
        .await;
    env.store
        .update_instance(
            inst.id,
            &InstancePatch::default().scheduler(SchedulerState {
                active: true,
                checks_performed: 18,
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    recovery::recover(
        env.state.store.as_ref(),
        &env.state.monitors,
        &env.state.tracker,
    )
    .await;
    assert_eq!(env.instance(inst.id).await.scheduler.checks_performed, 18);

    tokio::time::sleep(INTERVAL * 3 + Duration::from_secs(1)).await;
    let got = env.instance(inst.id).await;
    assert_eq!(got.scheduler.checks_performed, 20);
    assert!(!got.scheduler.active);
    assert_eq!(env.audit("INSTANCE_MONITOR_ABANDONED").await.len(), 1);
}
