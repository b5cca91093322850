//! Application state management

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::options::{AgentOptions, CoordinatorAppOptions};
use crate::coordinator::listener::StatusListener;
use crate::coordinator::presence::BranchPresence;
use crate::coordinator::scheduler::Scheduler;
use crate::coordinator::service::Coordinator;
use crate::coordinator::store::{JsonRecordStore, RecordStore};
use crate::errors::AgentError;
use crate::filesys::file::File;
use crate::mqtt::broker::Connector;
use crate::mqtt::transport::MqttTransport;
use crate::patch::engine::PatchEngine;
use crate::patch::host::SystemHost;
use crate::patch::reporter::MqttStatusReporter;
use crate::transfer::remote::FsRemoteStore;
use crate::transfer::service::TransferService;
use crate::workers::file_ops::FileOperationWorker;
use crate::workers::patch_listener::PatchListener;

/// Branch agent state
pub struct AgentState {
    pub transport: MqttTransport,

    pub transfer: Arc<TransferService>,

    /// Deployment requests, at most one running
    pub patch_listener: Arc<PatchListener>,

    /// Ad-hoc file operations
    pub file_ops: Arc<FileOperationWorker>,

    cancel: CancellationToken,
}

impl AgentState {
    pub fn new(options: &AgentOptions, connector: Arc<dyn Connector>) -> Self {
        let transport = MqttTransport::new(connector, options.transport.clone());
        let cancel = CancellationToken::new();

        let store = Arc::new(FsRemoteStore::new(options.remote_root.clone()));
        let transfer = Arc::new(TransferService::new(store, options.transfer.clone()));

        let engine = Arc::new(PatchEngine::new(
            options.patch.clone(),
            options.layout.clone(),
            transfer.clone(),
            Arc::new(SystemHost::new(options.layout.scripts_dir())),
            Arc::new(MqttStatusReporter::new(transport.clone(), &options.branch_id)),
        ));

        let patch_listener = Arc::new(PatchListener::new(engine, cancel.child_token()));
        let file_ops = Arc::new(FileOperationWorker::new(
            &options.branch_id,
            transport.clone(),
            transfer.clone(),
            cancel.child_token(),
        ));

        info!("Agent state initialized for branch {}", options.branch_id);

        Self {
            transport,
            transfer,
            patch_listener,
            file_ops,
            cancel,
        }
    }

    /// Cancel everything started from this state
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Coordinator state
pub struct CoordinatorState {
    pub transport: MqttTransport,
    pub store: Arc<dyn RecordStore>,
    pub coordinator: Arc<Coordinator>,
    pub presence: Arc<BranchPresence>,
    pub status_listener: Arc<StatusListener>,
    pub scheduler: Arc<Scheduler>,
}

impl CoordinatorState {
    pub async fn init(
        options: &CoordinatorAppOptions,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, AgentError> {
        let store: Arc<dyn RecordStore> =
            Arc::new(JsonRecordStore::open(File::new(options.records_file.clone())).await?);
        Ok(Self::with_store(options, connector, store))
    }

    /// Build the state around an existing record store
    pub fn with_store(
        options: &CoordinatorAppOptions,
        connector: Arc<dyn Connector>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        let transport = MqttTransport::new(connector, options.transport.clone());
        let coordinator = Arc::new(Coordinator::new(
            options.coordinator.clone(),
            store.clone(),
            transport.clone(),
        ));
        let presence = Arc::new(BranchPresence::new());
        let status_listener = Arc::new(StatusListener::new(
            coordinator.clone(),
            options.max_concurrent_status_updates,
        ));
        let scheduler = Arc::new(Scheduler::new(
            coordinator.clone(),
            presence.clone(),
            options.max_concurrent_scheduled,
        ));

        Self {
            transport,
            store,
            coordinator,
            presence,
            status_listener,
            scheduler,
        }
    }
}
