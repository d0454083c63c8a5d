mod common;

use axum::http::StatusCode;
use axum_test::TestServer;
use common::TestEnv;
use fleet_common::{InstanceStatus, JobStatus, ProgressSnapshot};
use fleet_orchestrator::{app, routes};
use serde_json::{json, Value};
use uuid::Uuid;

fn server(env: &TestEnv) -> TestServer {
    let app = routes::create_router()
        .with_state(env.state.clone())
        .layer(app::create_cors());
    TestServer::new(app).unwrap()
}

#[tokio::test]
async fn banner_and_health() {
    let env = TestEnv::new();
    let server = server(&env);

    let response = server.get("/").await;
    response.assert_status_ok();
    assert!(response.text().contains("Fleet Orchestrator"));

    let health: Value = server.get("/health").await.json();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["monitors"], 0);
}

#[tokio::test]
async fn register_and_fetch_instance() {
    let env = TestEnv::new();
    let server = server(&env);

    let response = server
        .post("/instances")
        .json(&json!({
            "marketplace_id": "vast-123",
            "host": "10.2.0.1",
            "port_hints": [8188],
            "monitor": false,
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let created: Value = response.json();
    assert_eq!(created["status"], "launching");
    assert_eq!(created["setup_status"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    let fetched: Value = server.get(&format!("/instances/{}", id)).await.json();
    assert_eq!(fetched["marketplace_id"], "vast-123");

    let missing = server.get(&format!("/instances/{}", Uuid::new_v4())).await;
    missing.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(missing.json::<Value>()["kind"], "not_found");
}

#[tokio::test]
async fn patch_instance_status() {
    let env = TestEnv::new();
    let server = server(&env);
    let inst = env
        .add_instance(Some("10.2.0.2"), vec![], InstanceStatus::Launching)
        .await;

    let updated: Value = server
        .patch(&format!("/instances/{}", inst.id))
        .json(&json!({ "status": "running" }))
        .await
        .json();
    assert_eq!(updated["status"], "running");
    assert_eq!(env.instance(inst.id).await.status, InstanceStatus::Running);
}

#[tokio::test]
async fn monitoring_start_status_stop() {
    let env = TestEnv::new();
    let server = server(&env);
    let inst = env
        .add_instance(Some("10.2.0.3"), vec![], InstanceStatus::Launching)
        .await;
    let path = format!("/instances/{}/monitoring", inst.id);

    let started = server.post(&path).await;
    started.assert_status(StatusCode::ACCEPTED);
    assert_eq!(started.json::<Value>()["active"], true);

    let status: Value = server.get(&path).await.json();
    assert_eq!(status["active"], true);
    assert_eq!(status["checks_performed"], 0);

    let stopped: Value = server.delete(&path).await.json();
    assert_eq!(stopped["stopped"], true);
    let status: Value = server.get(&path).await.json();
    assert_eq!(status["active"], false);

    server
        .post(&format!("/instances/{}/monitoring", Uuid::new_v4()))
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn discover_endpoint_route() {
    let env = TestEnv::new();
    let server = server(&env);
    let inst = env.healthy_instance().await;

    let result: Value = server
        .post(&format!("/instances/{}/discover", inst.id))
        .await
        .json();
    assert_eq!(result["resolved_url"], "http://10.0.0.5:8188");
    assert_eq!(result["attempted_urls"][0], "http://10.0.0.5:8188");
}

#[tokio::test]
async fn progress_routes() {
    let env = TestEnv::new();
    let server = server(&env);
    let job_id = Uuid::new_v4();

    server
        .get(&format!("/progress/{}", job_id))
        .await
        .assert_status(StatusCode::NOT_FOUND);

    env.state
        .hub
        .publish(ProgressSnapshot::queued(job_id, Uuid::nil(), 7))
        .await;
    let snap: Value = server.get(&format!("/progress/{}", job_id)).await.json();
    assert_eq!(snap["status"], "queued");
    assert_eq!(snap["total_nodes"], 7);

    let all: Value = server.get("/progress").await.json();
    assert_eq!(all.as_array().unwrap().len(), 1);

    let cleared: Value = server.delete(&format!("/progress/{}", job_id)).await.json();
    assert_eq!(cleared["cleared"], true);
    let all: Value = server.get("/progress").await.json();
    assert!(all.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn job_on_stopped_instance_is_a_conflict() {
    let env = TestEnv::new();
    let server = server(&env);
    let inst = env
        .add_instance(Some("10.2.0.4"), vec![8188], InstanceStatus::Stopped)
        .await;

    let response = server
        .post("/jobs")
        .json(&json!({
            "instance_id": inst.id,
            "params": { "prompt": "a cat" },
        }))
        .await;
    response.assert_status(StatusCode::CONFLICT);
    assert_eq!(response.json::<Value>()["kind"], "configuration");
    assert!(env.remote.submitted().is_empty());
}

#[tokio::test]
async fn create_submit_and_track_job() {
    let env = TestEnv::new();
    let server = server(&env);
    let inst = env.healthy_instance().await;

    let response = server
        .post("/jobs")
        .json(&json!({
            "instance_id": inst.id,
            "params": { "prompt": "a cat", "seed": 1 },
            "submit": false,
        }))
        .await;
    response.assert_status(StatusCode::CREATED);
    let job: Value = response.json();
    assert_eq!(job["status"], "queued");
    assert!(job["correlation_id"].is_null());
    let id = job["id"].as_str().unwrap().to_string();

    // nothing to track yet
    server
        .post(&format!("/jobs/{}/track", id))
        .await
        .assert_status(StatusCode::CONFLICT);

    let submitted: Value = server.post(&format!("/jobs/{}/submit", id)).await.json();
    assert_eq!(submitted["correlation_id"], "mock-prompt-1");

    let tracked = server
        .post(&format!("/jobs/{}/track", id))
        .add_query_param("correlation_id", "mock-prompt-1")
        .await;
    tracked.assert_status(StatusCode::ACCEPTED);

    let fetched: Value = server.get(&format!("/jobs/{}", id)).await.json();
    assert_eq!(fetched["status"], "queued");
    let job_id: Uuid = id.parse().unwrap();
    assert_eq!(env.job(job_id).await.status, JobStatus::Queued);
    assert!(env.state.tracker.stop_tracking(job_id));
}
