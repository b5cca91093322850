//! One deployment at a time per branch

use std::sync::Arc;
use std::time::Duration;

use patch_protocol::{
    PatchDeploymentRequest, PatchStatus, PatchStep, PATCH_REQUEST_TYPE_APPLICATION,
};
use tokio_util::sync::CancellationToken;

use branchpatch::errors::AgentError;
use branchpatch::mqtt::broker::MqttMessage;
use branchpatch::mqtt::dispatch::MessageHandler;
use branchpatch::mqtt::topics::Topics;
use branchpatch::patch::engine::{PatchEngine, PatchEngineOptions, PatchOutcome};
use branchpatch::storage::layout::StorageLayout;
use branchpatch::transfer::service::{TransferOptions, TransferService};
use branchpatch::workers::patch_listener::{PatchListener, StartDecision};

use crate::common::{FakeHost, GatedStore, RecordingSink};

struct Setup {
    _tmp: tempfile::TempDir,
    store: Arc<GatedStore>,
    sink: Arc<RecordingSink>,
    listener: PatchListener,
}

fn setup() -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(GatedStore::new(tmp.path()));
    let sink = Arc::new(RecordingSink::default());
    let transfer = Arc::new(TransferService::new(
        store.clone(),
        TransferOptions {
            max_attempts: 1,
            ..TransferOptions::default()
        },
    ));
    let options = PatchEngineOptions {
        app_dir: tmp.path().join("app"),
        main_executable: "kiosk".to_string(),
        target_processes: Vec::new(),
        service_name: "branch-agent".to_string(),
        backup_retention: 3,
        drain_delay: Duration::ZERO,
        stop_timeout: Duration::ZERO,
        restart_after_patch: false,
    };
    let engine = PatchEngine::new(
        options,
        StorageLayout::new(tmp.path().join("agent")),
        transfer,
        Arc::new(FakeHost::default()),
        sink.clone(),
    );

    Setup {
        _tmp: tmp,
        store,
        sink,
        listener: PatchListener::new(Arc::new(engine), CancellationToken::new()),
    }
}

fn request(job_id: &str) -> PatchDeploymentRequest {
    PatchDeploymentRequest {
        job_id: Some(job_id.to_string()),
        user_id: "ops".to_string(),
        patch_id: "v2.3.1".to_string(),
        patch_zip_path: "/patches/missing.zip".to_string(),
        expected_checksum: None,
        status: PatchStatus::Init,
        step: PatchStep::Start,
        request_type: PATCH_REQUEST_TYPE_APPLICATION.to_string(),
    }
}

#[tokio::test]
async fn test_second_job_is_rejected_while_one_runs() {
    let setup = setup();

    assert_eq!(
        setup.listener.start(request("job-a")),
        StartDecision::Started {
            job_id: "job-a".to_string()
        }
    );
    assert_eq!(
        setup.listener.start(request("job-a")),
        StartDecision::Duplicate {
            job_id: "job-a".to_string()
        }
    );
    assert_eq!(
        setup.listener.start(request("job-b")),
        StartDecision::Busy {
            active_job: "job-a".to_string()
        }
    );
    assert_eq!(setup.listener.active_job().as_deref(), Some("job-a"));

    setup.store.open();
    let outcomes = setup.listener.wait_idle().await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(
        outcomes[0],
        PatchOutcome::Failed {
            step: PatchStep::Download,
            ..
        }
    ));
    assert_eq!(setup.listener.active_job(), None);

    // Only job-a ever reported anything
    assert!(setup
        .sink
        .events()
        .iter()
        .all(|e| e.job_id.as_deref() == Some("job-a")));

    // The slot is free again
    assert!(matches!(
        setup.listener.start(request("job-b")),
        StartDecision::Started { .. }
    ));
    setup.store.open();
    setup.listener.wait_idle().await;
}

#[tokio::test]
async fn test_busy_branch_reports_rejected_job_as_failed() {
    let setup = setup();
    let topic = Topics::patch_request("BR007");
    let message = |job_id: &str| MqttMessage {
        topic: topic.clone(),
        payload: serde_json::to_vec(&request(job_id)).unwrap(),
    };

    setup.listener.handle(message("job-a")).await.unwrap();
    setup.listener.handle(message("job-b")).await.unwrap();

    let rejected: Vec<_> = setup
        .sink
        .events()
        .into_iter()
        .filter(|e| e.job_id.as_deref() == Some("job-b"))
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!((rejected[0].status, rejected[0].step), (PatchStatus::Failed, PatchStep::Start));
    assert!(rejected[0].is_terminal());
    assert!(rejected[0].message.contains("job-a"));

    // Redelivery of the running job is not a rejection
    setup.listener.handle(message("job-a")).await.unwrap();
    let rejections = setup
        .sink
        .events()
        .iter()
        .filter(|e| e.status == PatchStatus::Failed && e.step == PatchStep::Start)
        .count();
    assert_eq!(rejections, 1);
    assert_eq!(setup.listener.active_job().as_deref(), Some("job-a"));

    setup.store.open();
    setup.listener.wait_idle().await;
}

#[tokio::test]
async fn test_handler_rejects_malformed_requests() {
    let setup = setup();
    let topic = Topics::patch_request("BR007");

    let mut other_type = request("job-a");
    other_type.request_type = "Firmware".to_string();
    let result = setup
        .listener
        .handle(MqttMessage {
            topic: topic.clone(),
            payload: serde_json::to_vec(&other_type).unwrap(),
        })
        .await;
    assert!(matches!(result, Err(AgentError::ValidationError(_))));

    let mut no_path = request("job-a");
    no_path.patch_zip_path = "  ".to_string();
    let result = setup
        .listener
        .handle(MqttMessage {
            topic: topic.clone(),
            payload: serde_json::to_vec(&no_path).unwrap(),
        })
        .await;
    assert!(matches!(result, Err(AgentError::ValidationError(_))));

    let result = setup
        .listener
        .handle(MqttMessage {
            topic,
            payload: b"{not json".to_vec(),
        })
        .await;
    assert!(result.is_err());
    assert_eq!(setup.listener.active_job(), None);
}

#[tokio::test]
async fn test_request_without_job_id_uses_patch_id() {
    let setup = setup();
    let mut legacy = request("ignored");
    legacy.job_id = None;

    assert_eq!(
        setup.listener.start(legacy),
        StartDecision::Started {
            job_id: "v2.3.1".to_string()
        }
    );
    setup.store.open();
    setup.listener.wait_idle().await;
}
