//! Branch agent entry point
//!
//! Runs on a branch kiosk, receives patch deployments and file operations over
//! MQTT and reports their progress back to the coordinator.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use branchpatch::app::options::AgentOptions;
use branchpatch::app::run::run_agent;
use branchpatch::logs::{init_logging, LogOptions};
use branchpatch::mqtt::client::MqttConnector;
use branchpatch::storage::layout::StorageLayout;
use branchpatch::storage::settings::Settings;
use branchpatch::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
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

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => branchpatch::filesys::file::File::new(path),
        None => layout.settings_file(),
    };
    let settings = match settings_file.read_json::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file {:?}: {}", settings_file.path(), e);
            return;
        }
    };

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_to_file.then(|| layout.logs_dir().path().to_path_buf()),
        file_prefix: "branch-agent.log".to_string(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let connector = match MqttConnector::new(AgentOptions::connector_options(&settings)) {
        Ok(connector) => Arc::new(connector),
        Err(e) => {
            error!("Invalid broker configuration: {}", e);
            return;
        }
    };

    let options = AgentOptions::from_settings(&settings, layout);
    info!("Running branch agent {} with options: {:?}", version.version, options);

    if let Err(e) = run_agent(options, connector, await_shutdown_signal()).await {
        error!("Failed to run the branch agent: {e}");
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
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
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
