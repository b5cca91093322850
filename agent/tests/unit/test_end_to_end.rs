//! Agent and coordinator talking through one in-process broker

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use patch_protocol::{FileOperation, FileOperationRequest, FileOperationResult, PatchStatus, PatchStep};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use branchpatch::app::options::{AgentOptions, CoordinatorAppOptions};
use branchpatch::app::run::run_agent;
use branchpatch::app::state::CoordinatorState;
use branchpatch::coordinator::store::{JsonRecordStore, PatchArtifact, ProcessLevel, RecordStore};
use branchpatch::coordinator::DeployOutcome;
use branchpatch::mqtt::memory::MemoryBroker;
use branchpatch::mqtt::policy::MessageClass;
use branchpatch::mqtt::topics::Topics;
use branchpatch::mqtt::QoS;
use branchpatch::storage::layout::StorageLayout;
use branchpatch::storage::settings::{CoordinatorSettings, Settings};

use crate::common::{next_message, wait_until, write_zip, Forward};

const BRANCH: &str = "BR007";

fn agent_options(root: &Path) -> AgentOptions {
    let settings: Settings = serde_json::from_value(json!({
        "branch_id": BRANCH,
        "remote_store": { "root": root.join("store") },
        "patch": {
            "app_dir": root.join("app"),
            "main_executable": "kiosk",
            "drain_delay_secs": 0,
            "stop_timeout_secs": 0,
            "restart_after_patch": false
        },
        "transfer": { "attempt_delay_secs": 0, "chunk_retry_delay_ms": 0 }
    }))
    .unwrap();

    let mut options = AgentOptions::from_settings(&settings, StorageLayout::new(root.join("agent")));
    options.lifecycle.patch_drain_timeout = Duration::from_secs(5);
    options
}

async fn coordinator(root: &Path, broker: &MemoryBroker) -> CoordinatorState {
    let mut options = CoordinatorAppOptions::from_settings(
        &CoordinatorSettings::default(),
        StorageLayout::new(root.join("coordinator")),
    );
    options.coordinator.artifacts_root = root.join("store");

    let store: Arc<dyn RecordStore> = Arc::new(JsonRecordStore::in_memory());
    store
        .put_artifact(PatchArtifact {
            patch_id: "v2.3.1".to_string(),
            version: "2.3.1".to_string(),
            zip_path: r"\patches\v2.3.1.zip".to_string(),
            expected_checksum: None,
            process_level: ProcessLevel::Merged,
            patch_type: patch_protocol::PATCH_REQUEST_TYPE_APPLICATION.to_string(),
        })
        .await
        .unwrap();

    let state = CoordinatorState::with_store(&options, Arc::new(broker.connector("coordinator")), store);
    state
        .transport
        .subscribe(
            &Topics::all_service_status(),
            MessageClass::ServiceStatus.delivery().qos,
            state.presence.clone(),
        )
        .await
        .unwrap();
    state
        .transport
        .subscribe(
            &Topics::all_patch_status(),
            MessageClass::PatchTerminal.delivery().qos,
            state.status_listener.clone(),
        )
        .await
        .unwrap();
    state.transport.connect().await.unwrap();
    state
}

#[tokio::test]
async fn test_deploy_and_file_operations_over_the_broker() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();

    write_zip(
        &root.join("store/patches/v2.3.1.zip"),
        &[("kiosk", b"kiosk v2.3.1"), ("config/app.json", b"{\"theme\":\"dark\"}")],
    );
    tokio::fs::create_dir_all(root.join("app")).await.unwrap();
    tokio::fs::write(root.join("app/kiosk"), b"kiosk v2.2.0").await.unwrap();
    tokio::fs::write(root.join("app/local.db"), b"keep me").await.unwrap();

    let broker = MemoryBroker::new();
    let (stop_agent, stopped) = oneshot::channel::<()>();
    let agent = run_agent(
        agent_options(root),
        Arc::new(broker.connector(BRANCH)),
        async move {
            let _ = stopped.await;
        },
    );

    let scenario = async {
        let state = &coordinator(root, &broker).await;

        assert!(
            wait_until(|| async move { state.presence.is_online(BRANCH) }).await,
            "branch never came online"
        );

        // Patch deployment
        let outcome = state.coordinator.deploy(BRANCH, "v2.3.1", "ops-lead").await.unwrap();
        let DeployOutcome::Initiated { job_id } = outcome else {
            panic!("deployment was not initiated");
        };

        let deployed = wait_until(|| async move {
            state
                .store
                .get_enrollment(BRANCH, "v2.3.1")
                .await
                .unwrap()
                .is_some_and(|e| e.is_deployed())
        })
        .await;
        assert!(deployed, "deployment never completed");

        let job = state.store.get_job(&job_id).await.unwrap().unwrap();
        assert!(job.is_closed());
        assert_eq!((job.status, job.step), (PatchStatus::Success, PatchStep::Complete));

        assert_eq!(tokio::fs::read(root.join("app/kiosk")).await.unwrap(), b"kiosk v2.3.1");
        assert!(root.join("app/config/app.json").is_file());
        assert_eq!(tokio::fs::read(root.join("app/local.db")).await.unwrap(), b"keep me");

        // File operations
        let (sender, mut responses) = mpsc::unbounded_channel();
        state
            .transport
            .subscribe(
                &format!("server/{}/SFTP/+", BRANCH),
                QoS::ExactlyOnce,
                Arc::new(Forward(sender)),
            )
            .await
            .unwrap();

        let download = FileOperationRequest {
            request_id: Some("req-1".to_string()),
            source: "/patches/v2.3.1.zip".to_string(),
            dest: root.join("fetched/v2.3.1.zip").display().to_string(),
            user: "ops-lead".to_string(),
        };
        state
            .transport
            .publish_class(
                MessageClass::FileRequest,
                &Topics::file_request(BRANCH, FileOperation::Download),
                &download,
            )
            .await
            .unwrap();

        let result = loop {
            let message = next_message(&mut responses).await;
            if message.topic == Topics::file_response(BRANCH, FileOperation::Download) {
                break message.parse_json::<FileOperationResult>().unwrap();
            }
        };
        assert!(result.success, "{}", result.message);
        assert_eq!(result.request_id.as_deref(), Some("req-1"));
        assert_eq!(
            tokio::fs::read(root.join("fetched/v2.3.1.zip")).await.unwrap(),
            tokio::fs::read(root.join("store/patches/v2.3.1.zip")).await.unwrap()
        );

        let listing = FileOperationRequest {
            request_id: Some("req-2".to_string()),
            source: root.join("app").display().to_string(),
            dest: String::new(),
            user: "ops-lead".to_string(),
        };
        state
            .transport
            .publish_class(
                MessageClass::FileRequest,
                &Topics::file_request(BRANCH, FileOperation::FolderStucher),
                &listing,
            )
            .await
            .unwrap();

        let result = loop {
            let message = next_message(&mut responses).await;
            if message.topic == Topics::file_response(BRANCH, FileOperation::FolderStucher) {
                break message.parse_json::<FileOperationResult>().unwrap();
            }
        };
        assert!(result.success, "{}", result.message);
        let mut names: Vec<String> = result
            .entries
            .unwrap_or_default()
            .into_iter()
            .map(|entry| entry.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["config", "kiosk", "local.db"]);

        // Graceful stop announces OFFLINE
        let _ = stop_agent.send(());
        assert!(
            wait_until(|| async move { !state.presence.is_online(BRANCH) }).await,
            "branch never went offline"
        );
        assert_eq!(broker.retained(&Topics::service_status(BRANCH)).as_deref(), Some(&b"OFFLINE"[..]));

        state.transport.shutdown().await;
    };

    let (agent_result, ()) = tokio::join!(agent, scenario);
    agent_result.unwrap();
}
