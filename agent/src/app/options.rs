//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::coordinator::service::CoordinatorOptions;
use crate::mqtt::client::MqttConnectorOptions;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::TransportOptions;
use crate::patch::engine::PatchEngineOptions;
use crate::retry::RetryPolicy;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{CoordinatorSettings, HttpServerSettings, MqttBrokerSettings, Settings};
use crate::transfer::service::TransferOptions;
use crate::workers::scheduler;

/// Branch agent options
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    pub branch_id: String,

    /// Messaging transport; carries the presence topic
    pub transport: TransportOptions,

    /// Local mount point of the remote artifact store
    pub remote_root: PathBuf,

    pub patch: PatchEngineOptions,

    pub transfer: TransferOptions,
}

impl AgentOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            branch_id: settings.branch_id.clone(),
            transport: transport_options(
                &settings.mqtt_broker,
                Some(Topics::service_status(&settings.branch_id)),
            ),
            remote_root: settings.remote_store.root.clone(),
            patch: PatchEngineOptions::from(&settings.patch),
            transfer: TransferOptions::from(&settings.transfer),
        }
    }

    /// Broker connection options; the client id is the branch id
    pub fn connector_options(settings: &Settings) -> MqttConnectorOptions {
        MqttConnectorOptions::from_settings(&settings.mqtt_broker, &settings.branch_id)
    }
}

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorAppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Record store file
    pub records_file: PathBuf,

    pub transport: TransportOptions,

    pub coordinator: CoordinatorOptions,

    /// Status events persisted concurrently
    pub max_concurrent_status_updates: usize,

    /// Server configuration
    pub server: ServerOptions,

    /// Enable the scheduler worker
    pub enable_scheduler: bool,

    pub scheduler: scheduler::Options,

    /// Scheduled deployments started concurrently
    pub max_concurrent_scheduled: usize,
}

impl CoordinatorAppOptions {
    pub fn from_settings(settings: &CoordinatorSettings, layout: StorageLayout) -> Self {
        let records_file = settings
            .records_file
            .clone()
            .unwrap_or_else(|| layout.records_file().path().to_path_buf());

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            records_file,
            transport: transport_options(&settings.mqtt_broker, None),
            coordinator: CoordinatorOptions::from(settings),
            max_concurrent_status_updates: settings.max_concurrent_status_updates,
            server: ServerOptions::from(&settings.server),
            enable_scheduler: settings.scheduler.enabled,
            scheduler: scheduler::Options::from(&settings.scheduler),
            max_concurrent_scheduled: settings.scheduler.max_concurrent,
        }
    }
}

fn transport_options(broker: &MqttBrokerSettings, status_topic: Option<String>) -> TransportOptions {
    let defaults = TransportOptions::default();
    TransportOptions {
        publish_timeout: Duration::from_secs(broker.publish_timeout_secs.max(1)),
        reconnect: RetryPolicy::exponential(
            None,
            Duration::from_secs(1),
            Duration::from_secs(broker.reconnect_max_delay_secs.max(1)),
        )
        .with_jitter(Duration::from_secs(1)),
        max_inflight_publishes: broker.max_inflight_publishes.max(1),
        status_topic,
        ..defaults
    }
}

/// Lifecycle options
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,

    /// How long shutdown waits for a running patch to reach a safe end
    pub patch_drain_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(120),
            patch_drain_timeout: Duration::from_secs(90),
        }
    }
}

/// HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::from(&HttpServerSettings::default())
    }
}

impl From<&HttpServerSettings> for ServerOptions {
    fn from(settings: &HttpServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
        }
    }
}
