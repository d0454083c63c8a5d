mod common;

use std::time::Duration;

use common::{history_with_error, history_with_images, test_config, TestEnv};
use fleet_common::JobStatus;
use fleet_remote::{QueueSnapshot, RemoteError, RemoteEvent};
use serde_json::json;

#[tokio::test(start_paused = true)]
async fn completes_when_outputs_appear_on_fifth_poll() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-1")).await;
    for _ in 0..4 {
        env.remote.push_history(Ok(None));
    }
    env.remote.push_history(Ok(Some(history_with_images(2))));

    let tracker = env.state.tracker.clone();
    tracker.start_tracking(job.id, inst.id, "p-1").await.unwrap();
    let queued = tracker.get_progress(job.id).await.unwrap();
    assert_eq!(queued.status, JobStatus::Queued);
    assert_eq!(queued.fraction, 0.0);
    assert_eq!(queued.total_nodes, 7);

    // first poll at 2s, then every 5s: 2, 7, 12, 17, 22
    tokio::time::sleep(Duration::from_secs(25)).await;

    let done = env.job(job.id).await;
    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.image_urls.len(), 2);
    assert_eq!(
        done.image_urls[0],
        "http://10.0.0.5:8188/view?filename=fleet_00001_.png&subfolder=&type=output"
    );
    assert!(done.completed_at.is_some());
    assert_eq!(env.remote.history_calls(), 5);

    let snap = tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.fraction, 1.0);
    assert_eq!(snap.image_urls, done.image_urls);
    assert_eq!(env.audit("GENERATION_COMPLETED").await.len(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(env.remote.history_calls(), 5);
    assert!(!tracker.is_tracking(job.id));
}

#[tokio::test(start_paused = true)]
async fn fails_with_timeout_after_poll_cap() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-2")).await;

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-2")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2 + 59 * 5 + 10)).await;

    let failed = env.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_reason
        .as_deref()
        .unwrap_or_default()
        .contains("no outputs after 60 polls"));
    assert_eq!(env.remote.history_calls(), 60);
    assert_eq!(env.audit("GENERATION_FAILED").await.len(), 1);

    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Failed);
    assert_eq!(snap.attempts, 60);
}

#[tokio::test(start_paused = true)]
async fn poll_errors_count_toward_the_cap() {
    let mut config = test_config();
    config.job_max_polls = 3;
    let env = TestEnv::with_config(config);
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-3")).await;
    for _ in 0..3 {
        env.remote.push_history(Err(RemoteError::Status {
            status: 503,
            body: "busy".into(),
        }));
    }

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-3")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let failed = env.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    let reason = failed.error_reason.unwrap_or_default();
    assert!(reason.contains("no outputs after 3 polls"), "{}", reason);
    assert!(reason.contains("503"), "{}", reason);
    assert_eq!(env.remote.history_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn remote_execution_error_fails_immediately() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-4")).await;
    env.remote.push_history(Ok(None));
    env.remote
        .push_history(Ok(Some(history_with_error("3", "CUDA out of memory"))));

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-4")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let failed = env.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(
        failed.error_reason.as_deref(),
        Some("remote execution error: node 3: CUDA out of memory")
    );
    assert_eq!(env.remote.history_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn running_prompt_promotes_job_to_executing() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-5")).await;
    env.remote.set_queue(QueueSnapshot {
        queue_running: vec![json!([0, "p-5", {}, {}, []])],
        queue_pending: vec![],
    });

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-5")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(env.job(job.id).await.status, JobStatus::Executing);
    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Executing);
    assert_eq!(snap.attempts, 1);
    assert_eq!(env.audit("GENERATION_STATUS_TRANSITION").await.len(), 1);
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test(start_paused = true)]
async fn deleted_job_stops_tracking() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-6")).await;

    let tracker = env.state.tracker.clone();
    tracker.start_tracking(job.id, inst.id, "p-6").await.unwrap();
    assert!(tracker.is_tracking(job.id));
    env.store.remove_job(job.id).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!tracker.is_tracking(job.id));
    assert_eq!(env.remote.history_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn unreachable_instance_counts_as_failed_poll() {
    let mut config = test_config();
    config.job_max_polls = 2;
    let env = TestEnv::with_config(config);
    // nothing answers on this host
    let inst = env
        .add_instance(Some("10.0.0.77"), vec![8188], fleet_common::InstanceStatus::Running)
        .await;
    let job = env.add_job(inst.id, Some("p-7")).await;

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-7")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let failed = env.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed
        .error_reason
        .unwrap_or_default()
        .contains("no reachable endpoint"));
    assert_eq!(env.remote.history_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn push_events_refine_the_snapshot() {
    let mut config = test_config();
    config.remote_events = true;
    let env = TestEnv::with_config(config);
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-8")).await;
    env.remote.set_events(vec![
        RemoteEvent::ExecutionStart {
            prompt_id: "p-8".into(),
        },
        RemoteEvent::Executing {
            prompt_id: Some("p-8".into()),
            node: Some("4".into()),
        },
        RemoteEvent::Executing {
            prompt_id: Some("p-8".into()),
            node: Some("3".into()),
        },
        RemoteEvent::Progress {
            prompt_id: Some("p-8".into()),
            node: Some("3".into()),
            value: 5,
            max: 20,
        },
        // someone else's prompt
        RemoteEvent::Executing {
            prompt_id: Some("other".into()),
            node: Some("8".into()),
        },
    ]);

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-8")
        .await
        .unwrap();
    // before the first poll
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(env.remote.subscriptions(), vec![job.id.to_string()]);
    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.status, JobStatus::Executing);
    assert_eq!(snap.stage, "sampling");
    assert_eq!(snap.current_node.as_deref(), Some("3"));
    assert_eq!(snap.completed_nodes, 1);
    assert!(snap.fraction > 0.0 && snap.fraction < 1.0);
    // the record itself is only moved by polling
    assert_eq!(env.job(job.id).await.status, JobStatus::Queued);
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test(start_paused = true)]
async fn pending_polls_keep_pushed_error_detail() {
    let mut config = test_config();
    config.remote_events = true;
    let env = TestEnv::with_config(config);
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-9")).await;
    env.remote.set_events(vec![RemoteEvent::ExecutionError {
        prompt_id: "p-9".into(),
        node: Some("5".into()),
        message: "CUDA out of memory".into(),
    }]);

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-9")
        .await
        .unwrap();
    // polls at 2s and 7s find nothing yet
    tokio::time::sleep(Duration::from_secs(8)).await;

    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.attempts, 2);
    assert_eq!(snap.stage, "error");
    assert_eq!(snap.last_error.as_deref(), Some("node 5: CUDA out of memory"));
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test(start_paused = true)]
async fn successful_poll_clears_previous_poll_error() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let job = env.add_job(inst.id, Some("p-10")).await;
    env.remote.push_history(Err(RemoteError::Status {
        status: 503,
        body: "busy".into(),
    }));

    env.state
        .tracker
        .start_tracking(job.id, inst.id, "p-10")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert!(snap.last_error.unwrap_or_default().contains("503"));

    tokio::time::sleep(Duration::from_secs(5)).await;
    let snap = env.state.tracker.get_progress(job.id).await.unwrap();
    assert_eq!(snap.attempts, 2);
    assert_eq!(snap.last_error, None);
    env.state.tracker.stop_tracking(job.id);
}
