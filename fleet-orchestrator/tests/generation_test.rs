mod common;

use common::TestEnv;
use fleet_common::{GenerationParams, InstanceStatus, JobStatus};
use fleet_orchestrator::store::RecordStore;
use fleet_remote::{PromptAccepted, RemoteError};

fn params() -> GenerationParams {
    GenerationParams {
        prompt: "a red fox in snow".into(),
        seed: Some(42),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn submit_persists_correlation_and_starts_tracking() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    let service = &env.state.generation;

    let job = service.create_job(inst.id, None, params()).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);

    let submitted = service.submit_generation(job.id).await.unwrap();
    assert_eq!(submitted.correlation_id.as_deref(), Some("mock-prompt-1"));
    assert!(env.state.tracker.is_tracking(job.id));

    let sent = env.remote.submitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "http://10.0.0.5:8188");
    assert_eq!(sent[0].1.client_id, job.id.to_string());
    assert_eq!(sent[0].1.prompt["3"]["inputs"]["seed"], 42);
    assert_eq!(sent[0].1.prompt["6"]["inputs"]["text"], "a red fox in snow");

    let audit = env.audit("GENERATION_SUBMITTED").await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0].status, "success");

    // already submitted: no second prompt
    service.submit_generation(job.id).await.unwrap();
    assert_eq!(env.remote.submitted().len(), 1);
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test(start_paused = true)]
async fn instance_not_running_fails_the_job() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.5"), vec![8188], InstanceStatus::Launching)
        .await;
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    let err = service.submit_generation(job.id).await.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    let failed = env.job(job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error_reason.unwrap_or_default().contains("not running"));
    assert!(env.remote.submitted().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unreachable_instance_lists_attempted_urls() {
    let env = TestEnv::new();
    let inst = env
        .add_instance(Some("10.0.0.6"), vec![8188], InstanceStatus::Running)
        .await;
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    let err = service.submit_generation(job.id).await.unwrap_err();
    assert_eq!(err.kind(), "transient_network");
    let reason = env.job(job.id).await.error_reason.unwrap_or_default();
    assert!(reason.contains("http://10.0.0.6:8188"), "{}", reason);
    assert!(reason.contains("http://10.0.0.6:3000"), "{}", reason);
}

#[tokio::test(start_paused = true)]
async fn rejection_is_not_retried() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    env.remote.push_submit_result(Err(RemoteError::Rejected {
        message: "Prompt outputs failed validation".into(),
        node_errors: serde_json::json!({"4": {"errors": ["ckpt_name not in list"]}}),
    }));
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    let err = service.submit_generation(job.id).await.unwrap_err();
    assert_eq!(err.kind(), "remote_rejected");
    assert_eq!(env.remote.submitted().len(), 1);
    assert_eq!(env.job(job.id).await.status, JobStatus::Failed);
    assert!(!env.state.tracker.is_tracking(job.id));

    let audit = env.audit("GENERATION_SUBMITTED").await;
    assert_eq!(audit[0].status, "failed");
}

#[tokio::test(start_paused = true)]
async fn transient_submit_errors_are_retried() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    env.remote.push_submit_result(Err(RemoteError::Status {
        status: 502,
        body: "bad gateway".into(),
    }));
    env.remote.push_submit_result(Ok(PromptAccepted {
        prompt_id: "p-77".into(),
        number: Some(3),
    }));
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    let submitted = service.submit_generation(job.id).await.unwrap();
    assert_eq!(submitted.correlation_id.as_deref(), Some("p-77"));
    assert_eq!(env.remote.submitted().len(), 2);
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test]
async fn job_for_unknown_instance_is_refused() {
    let env = TestEnv::new();
    let err = env
        .state
        .generation
        .create_job(uuid::Uuid::new_v4(), None, params())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test(start_paused = true)]
async fn second_submit_while_first_is_retrying_is_refused() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    env.remote.push_submit_result(Err(RemoteError::Status {
        status: 502,
        body: "bad gateway".into(),
    }));
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    // the first call parks in its retry delay while the second runs
    let (first, second) = tokio::join!(
        service.submit_generation(job.id),
        service.submit_generation(job.id)
    );
    assert_eq!(
        first.unwrap().correlation_id.as_deref(),
        Some("mock-prompt-1")
    );
    let err = second.unwrap_err();
    assert_eq!(err.kind(), "configuration");
    assert!(err.to_string().contains("already being submitted"));
    assert_eq!(env.remote.submitted().len(), 2);
    assert_eq!(env.audit("GENERATION_SUBMITTED").await.len(), 1);

    // the guard is released afterwards
    service.submit_generation(job.id).await.unwrap();
    assert_eq!(env.remote.submitted().len(), 2);
    env.state.tracker.stop_tracking(job.id);
}

#[tokio::test(start_paused = true)]
async fn correlation_id_written_elsewhere_wins() {
    let env = TestEnv::new();
    let inst = env.healthy_instance().await;
    env.remote.push_submit_result(Err(RemoteError::Status {
        status: 502,
        body: "bad gateway".into(),
    }));
    let service = &env.state.generation;
    let job = service.create_job(inst.id, None, params()).await.unwrap();

    let (submitted, claimed) = tokio::join!(
        service.submit_generation(job.id),
        env.store.claim_correlation_id(job.id, "p-other")
    );
    assert!(claimed.unwrap());
    let submitted = submitted.unwrap();
    assert_eq!(submitted.correlation_id.as_deref(), Some("p-other"));
    assert!(!env.state.tracker.is_tracking(job.id));
    assert_eq!(env.job(job.id).await.status, JobStatus::Queued);
}
