//! Process run loops for the branch agent and the coordinator

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::app::options::{AgentOptions, CoordinatorAppOptions, LifecycleOptions};
use crate::app::state::{AgentState, CoordinatorState};
use crate::errors::AgentError;
use crate::mqtt::broker::Connector;
use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::MqttTransport;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::file_ops::FileOperationWorker;
use crate::workers::patch_listener::PatchListener;
use crate::workers::scheduler;

/// Run the branch agent until `shutdown_signal` resolves
pub async fn run_agent(
    options: AgentOptions,
    connector: Arc<dyn Connector>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing branch agent for {}...", options.branch_id);

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init_agent(&options, connector, &mut shutdown_manager).await {
        error!("Failed to start branch agent: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

/// Run the coordinator until `shutdown_signal` resolves
pub async fn run_coordinator(
    options: CoordinatorAppOptions,
    connector: Arc<dyn Connector>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), AgentError> {
    info!("Initializing patch coordinator...");

    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init_coordinator(&options, connector, &shutdown_tx, &mut shutdown_manager).await {
        error!("Failed to start coordinator: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init_agent(
    options: &AgentOptions,
    connector: Arc<dyn Connector>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    options.layout.setup().await?;

    let state = AgentState::new(options, connector);
    shutdown_manager.with_transport(state.transport.clone())?;
    shutdown_manager.with_patch_listener(state.patch_listener.clone(), options.lifecycle.patch_drain_timeout)?;
    shutdown_manager.with_file_ops(state.file_ops.clone())?;

    // Handlers are registered before the first connect so nothing retained is missed
    state
        .transport
        .subscribe(
            &Topics::patch_request(&options.branch_id),
            MessageClass::PatchRequest.delivery().qos,
            state.patch_listener.clone(),
        )
        .await?;
    state
        .transport
        .subscribe(
            &Topics::all_file_requests(&options.branch_id),
            MessageClass::FileRequest.delivery().qos,
            state.file_ops.clone(),
        )
        .await?;

    let branch_id = options.branch_id.clone();
    state.transport.on_reconnected(move || {
        info!("Branch {} reconnected, subscriptions restored", branch_id);
    });

    connect_or_retry(&state.transport).await;
    Ok(())
}

async fn init_coordinator(
    options: &CoordinatorAppOptions,
    connector: Arc<dyn Connector>,
    shutdown_tx: &broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), AgentError> {
    options.layout.setup().await?;

    let state = CoordinatorState::init(options, connector).await?;
    shutdown_manager.with_transport(state.transport.clone())?;

    state
        .transport
        .subscribe(
            &Topics::all_service_status(),
            MessageClass::ServiceStatus.delivery().qos,
            state.presence.clone(),
        )
        .await?;
    state
        .transport
        .subscribe(
            &Topics::all_patch_status(),
            MessageClass::PatchTerminal.delivery().qos,
            state.status_listener.clone(),
        )
        .await?;

    state.transport.on_reconnected(|| {
        info!("Coordinator reconnected, subscriptions restored");
    });

    connect_or_retry(&state.transport).await;

    init_http_server(options, &state, shutdown_manager, shutdown_tx.subscribe()).await?;

    if options.enable_scheduler {
        init_scheduler_worker(options, &state, shutdown_manager, shutdown_tx.subscribe())?;
    }

    Ok(())
}

async fn connect_or_retry(transport: &MqttTransport) {
    if let Err(e) = transport.connect().await {
        warn!("Initial broker connection failed: {}, retrying in the background", e);
        transport.reconnect_in_background();
    }
}

async fn init_http_server(
    options: &CoordinatorAppOptions,
    state: &CoordinatorState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        state.coordinator.clone(),
        state.presence.clone(),
        state.transport.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

fn init_scheduler_worker(
    options: &CoordinatorAppOptions,
    state: &CoordinatorState,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), AgentError> {
    info!("Initializing scheduler worker...");

    let worker_options = options.scheduler.clone();
    let scheduler = state.scheduler.clone();

    let handle = tokio::spawn(async move {
        scheduler::run(
            &worker_options,
            scheduler.as_ref(),
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_scheduler_worker_handle(handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    patch_listener: Option<(Arc<PatchListener>, Duration)>,
    file_ops: Option<Arc<FileOperationWorker>>,
    scheduler_worker_handle: Option<JoinHandle<()>>,
    server_handle: Option<JoinHandle<Result<(), AgentError>>>,
    transport: Option<MqttTransport>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            patch_listener: None,
            file_ops: None,
            scheduler_worker_handle: None,
            server_handle: None,
            transport: None,
        }
    }

    pub fn with_patch_listener(
        &mut self,
        listener: Arc<PatchListener>,
        drain_timeout: Duration,
    ) -> Result<(), AgentError> {
        if self.patch_listener.is_some() {
            return Err(AgentError::ShutdownError("patch_listener already set".to_string()));
        }
        self.patch_listener = Some((listener, drain_timeout));
        Ok(())
    }

    pub fn with_file_ops(&mut self, file_ops: Arc<FileOperationWorker>) -> Result<(), AgentError> {
        if self.file_ops.is_some() {
            return Err(AgentError::ShutdownError("file_ops already set".to_string()));
        }
        self.file_ops = Some(file_ops);
        Ok(())
    }

    pub fn with_scheduler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), AgentError> {
        if self.scheduler_worker_handle.is_some() {
            return Err(AgentError::ShutdownError("scheduler_handle already set".to_string()));
        }
        self.scheduler_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), AgentError>>,
    ) -> Result<(), AgentError> {
        if self.server_handle.is_some() {
            return Err(AgentError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub fn with_transport(&mut self, transport: MqttTransport) -> Result<(), AgentError> {
        if self.transport.is_some() {
            return Err(AgentError::ShutdownError("transport already set".to_string()));
        }
        self.transport = Some(transport);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), AgentError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), AgentError> {
        info!("Shutting down...");

        // 1. Scheduler worker
        if let Some(handle) = self.scheduler_worker_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| AgentError::ShutdownError(e.to_string()))??;
        }

        // 3. Running patch job; its final status still needs the transport
        if let Some((listener, drain_timeout)) = self.patch_listener.take() {
            listener.shutdown(drain_timeout).await;
        }

        // 4. File operations
        if let Some(file_ops) = self.file_ops.take() {
            file_ops.shutdown().await;
        }

        // 5. Transport last, publishing OFFLINE
        if let Some(transport) = self.transport.take() {
            transport.shutdown().await;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
