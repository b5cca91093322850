//! Patch coordinator entry point
//!
//! Dispatches patch deployments to branches over MQTT, tracks their status
//! events and serves the deployment HTTP API.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use branchpatch::app::options::CoordinatorAppOptions;
use branchpatch::app::run::run_coordinator;
use branchpatch::filesys::file::File;
use branchpatch::logs::{init_logging, LogOptions};
use branchpatch::mqtt::client::{MqttConnector, MqttConnectorOptions};
use branchpatch::storage::layout::StorageLayout;
use branchpatch::storage::settings::CoordinatorSettings;
use branchpatch::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    let mut cli_args: HashMap<String, String> = HashMap::new();
    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            cli_args.insert(key.trim_start_matches('-').to_string(), value.to_string());
        } else if arg.starts_with("--") {
            cli_args.insert(arg.trim_start_matches('-').to_string(), "true".to_string());
        }
    }

    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.coordinator_settings_file(),
    };
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<CoordinatorSettings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {:?}: {}", settings_file.path(), e);
                return;
            }
        }
    } else {
        eprintln!("No settings at {:?}, using defaults", settings_file.path());
        CoordinatorSettings::default()
    };

    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_to_file.then(|| layout.logs_dir().path().to_path_buf()),
        file_prefix: "patch-coordinator.log".to_string(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let connector_options = MqttConnectorOptions::from_settings(&settings.mqtt_broker, &settings.client_id);
    let connector = match MqttConnector::new(connector_options) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            error!("Invalid broker configuration: {}", e);
            return;
        }
    };

    let options = CoordinatorAppOptions::from_settings(&settings, layout);
    info!("Running patch coordinator {} with options: {:?}", version.version, options);

    if let Err(e) = run_coordinator(options, connector, await_shutdown_signal()).await {
        error!("Failed to run the coordinator: {e}");
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (Ok(mut sigterm), Ok(mut sigint)) =
            (signal(SignalKind::terminate()), signal(SignalKind::interrupt()))
        else {
            error!("Failed to install signal handlers, waiting for Ctrl+C only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => info!("SIGTERM received, shutting down..."),
            _ = sigint.recv() => info!("SIGINT received, shutting down..."),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
