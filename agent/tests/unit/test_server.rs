//! Coordinator HTTP routes

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use patch_protocol::ServiceStatus;
use serde_json::{json, Value};
use tower::ServiceExt;

use branchpatch::coordinator::presence::BranchPresence;
use branchpatch::coordinator::store::{JsonRecordStore, PatchArtifact, ProcessLevel, RecordStore};
use branchpatch::coordinator::{Coordinator, CoordinatorOptions};
use branchpatch::mqtt::memory::MemoryBroker;
use branchpatch::mqtt::transport::{MqttTransport, TransportOptions};
use branchpatch::server::serve::router;
use branchpatch::server::state::ServerState;

async fn app() -> Router {
    let store = Arc::new(JsonRecordStore::in_memory());
    store
        .put_artifact(PatchArtifact {
            patch_id: "v2.3.1".to_string(),
            version: "2.3.1".to_string(),
            zip_path: "/patches/v2.3.1.zip".to_string(),
            expected_checksum: Some("ab".repeat(32)),
            process_level: ProcessLevel::Ready,
            patch_type: patch_protocol::PATCH_REQUEST_TYPE_APPLICATION.to_string(),
        })
        .await
        .unwrap();

    let broker = MemoryBroker::new();
    let transport = MqttTransport::new(Arc::new(broker.connector("coordinator")), TransportOptions::default());
    transport.connect().await.unwrap();

    let presence = Arc::new(BranchPresence::new());
    presence.update("BR001", ServiceStatus::Online);

    let coordinator = Arc::new(Coordinator::new(
        CoordinatorOptions::default(),
        store,
        transport.clone(),
    ));
    router(Arc::new(ServerState::new(coordinator, presence, transport)))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let app = app().await;
    let (status, body) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["brokerConnected"], true);
    assert_eq!(body["onlineBranches"], 1);
}

#[tokio::test]
async fn test_deploy_then_fetch_job_and_enrollment() {
    let app = app().await;

    let (status, body) = send(
        &app,
        post(
            "/deployments",
            json!({ "branchIds": ["BR001", "BR/002"], "patchId": "v2.3.1", "userId": "ops" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["initiated"].as_array().unwrap().len(), 1);
    assert_eq!(body["failed"][0]["branchId"], "BR/002");

    let job_id = body["initiated"][0]["jobId"].as_str().unwrap().to_string();
    let (status, job) = send(&app, get(&format!("/jobs/{}", job_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["jobId"], job_id.as_str());
    assert_eq!(job["status"], "INIT");
    assert_eq!(job["step"], "START");

    let (status, enrollment) = send(&app, get("/branches/BR001/enrollments/v2.3.1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(enrollment["jobId"], job_id.as_str());
    assert_eq!(enrollment["attemptCount"], 1);
}

#[tokio::test]
async fn test_deploy_requires_branches() {
    let app = app().await;
    let (status, body) = send(
        &app,
        post(
            "/deployments",
            json!({ "branchIds": [], "patchId": "v2.3.1", "userId": "ops" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("branchIds"));
}

#[tokio::test]
async fn test_schedule_and_conflicts() {
    let app = app().await;

    let (status, body) = send(
        &app,
        post(
            "/schedules",
            json!({
                "branchId": "BR004",
                "patchId": "v2.3.1",
                "userId": "ops",
                "scheduledAt": "2030-01-01T02:00:00Z"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "SCHEDULE");
    assert_eq!(body["scheduledAt"], "2030-01-01T02:00:00Z");

    let (status, _) = send(
        &app,
        post(
            "/schedules",
            json!({
                "branchId": "BR004",
                "patchId": "v0.0.1",
                "userId": "ops",
                "scheduledAt": "2030-01-01T02:00:00Z"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A running deployment cannot be rescheduled
    send(
        &app,
        post(
            "/deployments",
            json!({ "branchIds": ["BR005"], "patchId": "v2.3.1", "userId": "ops" }),
        ),
    )
    .await;
    let (status, _) = send(
        &app,
        post(
            "/schedules",
            json!({
                "branchId": "BR005",
                "patchId": "v2.3.1",
                "userId": "ops",
                "scheduledAt": "2030-01-01T02:00:00Z"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_unknown_records_are_404() {
    let app = app().await;

    let (status, body) = send(&app, get("/jobs/BR001-0-deadbeef")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());

    let (status, _) = send(&app, get("/branches/BR001/enrollments/v2.3.1")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
