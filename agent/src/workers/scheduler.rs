//! Scheduler worker for deferred deployments

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::coordinator::scheduler::Scheduler;
use crate::storage::settings::SchedulerSettings;

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Polling interval
    pub interval: Duration,

    /// Initial delay before the first pass, so presence has a chance to fill in
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl From<&SchedulerSettings> for Options {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            ..Default::default()
        }
    }
}

/// Run the scheduler worker
pub async fn run<S, F>(
    options: &Options,
    scheduler: &Scheduler,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Scheduler worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Scheduler worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        match scheduler.run_due(Utc::now()).await {
            Ok(report) if report.due > 0 => info!(
                "Scheduler pass: {} due, {} started, {} offline, {} failed",
                report.due, report.started, report.skipped_offline, report.failed
            ),
            Ok(_) => debug!("No scheduled deployments due"),
            Err(e) => error!("Scheduler pass failed: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Scheduler worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
