//! Settings file management

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::logs::LogLevel;

/// Branch agent settings (`settings.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Branch identifier used in every topic this agent touches
    pub branch_id: String,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Also write rolling log files under the storage logs directory
    #[serde(default)]
    pub log_to_file: bool,

    /// MQTT broker configuration
    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    /// Remote artifact store
    #[serde(default)]
    pub remote_store: RemoteStoreSettings,

    /// Patch engine configuration
    #[serde(default)]
    pub patch: PatchSettings,

    /// Resumable transfer tuning
    #[serde(default)]
    pub transfer: TransferSettings,
}

fn default_true() -> bool {
    true
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBrokerSettings {
    /// Broker host
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    /// Use TLS
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Optional path to a PEM-encoded CA certificate for broker TLS verification.
    /// When absent, the system certificate store is used.
    #[serde(default)]
    pub ca_cert_path: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,

    /// Cap for the reconnect backoff
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,

    /// Concurrent publishes allowed through the client
    #[serde(default = "default_max_inflight")]
    pub max_inflight_publishes: usize,
}

fn default_mqtt_host() -> String {
    "".to_string()
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_publish_timeout() -> u64 {
    5
}

fn default_reconnect_max_delay() -> u64 {
    60
}

fn default_max_inflight() -> usize {
    10
}

impl Default for MqttBrokerSettings {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            tls: true,
            ca_cert_path: None,
            username: None,
            password: None,
            keep_alive_secs: default_keep_alive(),
            publish_timeout_secs: default_publish_timeout(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            max_inflight_publishes: default_max_inflight(),
        }
    }
}

/// Remote artifact store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStoreSettings {
    /// Local mount point of the remote store; remote paths resolve below it
    #[serde(default = "default_remote_root")]
    pub root: PathBuf,
}

fn default_remote_root() -> PathBuf {
    PathBuf::from("/mnt/patch-store")
}

impl Default for RemoteStoreSettings {
    fn default() -> Self {
        Self {
            root: default_remote_root(),
        }
    }
}

/// Patch engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSettings {
    /// Live application directory that updates are merged into
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,

    /// Main executable, relative to `app_dir`
    #[serde(default = "default_main_executable")]
    pub main_executable: String,

    /// Process names stopped before backup
    #[serde(default)]
    pub target_processes: Vec<String>,

    /// OS service stopped before the scheduled reboot
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Backups kept after cleanup
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    /// Wait after the final status so it leaves the outbound queue
    #[serde(default = "default_drain_delay")]
    pub drain_delay_secs: u64,

    /// Graceful exit window for each stopped process
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,

    /// Set to false to skip the restart script (useful on developer machines)
    #[serde(default = "default_true")]
    pub restart_after_patch: bool,
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("/opt/kiosk/app")
}

fn default_main_executable() -> String {
    "kiosk".to_string()
}

fn default_service_name() -> String {
    "branch-agent".to_string()
}

fn default_backup_retention() -> usize {
    3
}

fn default_drain_delay() -> u64 {
    3
}

fn default_stop_timeout() -> u64 {
    15
}

impl Default for PatchSettings {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            main_executable: default_main_executable(),
            target_processes: Vec::new(),
            service_name: default_service_name(),
            backup_retention: default_backup_retention(),
            drain_delay_secs: default_drain_delay(),
            stop_timeout_secs: default_stop_timeout(),
            restart_after_patch: true,
        }
    }
}

/// Transfer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,

    #[serde(default = "default_chunk_retries")]
    pub chunk_retries: u32,

    #[serde(default = "default_chunk_retry_delay")]
    pub chunk_retry_delay_ms: u64,

    /// Whole-transfer attempts, each on a fresh session
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_attempt_delay")]
    pub attempt_delay_secs: u64,

    /// Minimum percentage advance between progress reports
    #[serde(default = "default_progress_step")]
    pub progress_step_percent: u8,
}

fn default_chunk_size() -> usize {
    4 * 1024 * 1024
}

fn default_chunk_retries() -> u32 {
    3
}

fn default_chunk_retry_delay() -> u64 {
    500
}

fn default_max_attempts() -> u32 {
    3
}

fn default_attempt_delay() -> u64 {
    2
}

fn default_progress_step() -> u8 {
    2
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size_bytes: default_chunk_size(),
            chunk_retries: default_chunk_retries(),
            chunk_retry_delay_ms: default_chunk_retry_delay(),
            max_attempts: default_max_attempts(),
            attempt_delay_secs: default_attempt_delay(),
            progress_step_percent: default_progress_step(),
        }
    }
}

/// Coordinator settings (`coordinator.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorSettings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default)]
    pub log_to_file: bool,

    /// Client id used towards the broker
    #[serde(default = "default_coordinator_client_id")]
    pub client_id: String,

    #[serde(default)]
    pub mqtt_broker: MqttBrokerSettings,

    #[serde(default)]
    pub server: HttpServerSettings,

    /// Directory the merged artifacts live in, used for checksum computation
    #[serde(default = "default_remote_root")]
    pub artifacts_root: PathBuf,

    /// Record store file; defaults to `records.json` under the base directory
    #[serde(default)]
    pub records_file: Option<PathBuf>,

    /// Attempts after which a retry restarts from scratch instead of resuming
    #[serde(default = "default_attempt_threshold")]
    pub attempt_threshold: u32,

    /// In-flight enrollments older than this are retried instead of attached to
    #[serde(default = "default_stale_job_after")]
    pub stale_job_after_secs: u64,

    /// Status events persisted concurrently
    #[serde(default = "default_status_concurrency")]
    pub max_concurrent_status_updates: usize,

    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

fn default_coordinator_client_id() -> String {
    "patch-coordinator".to_string()
}

fn default_attempt_threshold() -> u32 {
    3
}

fn default_stale_job_after() -> u64 {
    2 * 60 * 60
}

fn default_status_concurrency() -> usize {
    100
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_to_file: false,
            client_id: default_coordinator_client_id(),
            mqtt_broker: MqttBrokerSettings::default(),
            server: HttpServerSettings::default(),
            artifacts_root: default_remote_root(),
            records_file: None,
            attempt_threshold: default_attempt_threshold(),
            stale_job_after_secs: default_stale_job_after(),
            max_concurrent_status_updates: default_status_concurrency(),
            scheduler: SchedulerSettings::default(),
        }
    }
}

/// Coordinator HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpServerSettings {
    #[serde(default = "default_http_host")]
    pub host: String,

    #[serde(default = "default_http_port")]
    pub port: u16,
}

fn default_http_host() -> String {
    "127.0.0.1".to_string()
}

fn default_http_port() -> u16 {
    8080
}

impl Default for HttpServerSettings {
    fn default() -> Self {
        Self {
            host: default_http_host(),
            port: default_http_port(),
        }
    }
}

/// Scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scheduler_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_scheduler_concurrency")]
    pub max_concurrent: usize,
}

fn default_scheduler_interval() -> u64 {
    30
}

fn default_scheduler_concurrency() -> usize {
    10
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_scheduler_interval(),
            max_concurrent: default_scheduler_concurrency(),
        }
    }
}
