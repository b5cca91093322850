//! Branch patch state machine
//!
//! One deployment runs `DOWNLOAD → VALIDATE → EXTRACT → STOP_APP → BACKUP →
//! UPDATE → START_APP → VERIFY → CLEANUP → COMPLETE` strictly in order, publishing
//! a status event around every phase. Failures before BACKUP leave the live
//! directory untouched and simply end the job. Failures from UPDATE on restore
//! the backup and restart the host.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use patch_protocol::{PatchDeploymentRequest, PatchStatus, PatchStep, StatusEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::patch::archive::extract_zip;
use crate::patch::host::{stop_processes, HostControl};
use crate::patch::reporter::StatusSink;
use crate::patch::tracker::{done_progress, start_progress, PatchTracker};
use crate::storage::layout::StorageLayout;
use crate::storage::settings::PatchSettings;
use crate::transfer::service::TransferService;
use crate::transfer::sink::{LogSink, TransferOutcome};
use crate::utils::{checksums_match, sha256_file};

/// Patch engine options
#[derive(Debug, Clone)]
pub struct PatchEngineOptions {
    pub app_dir: PathBuf,
    pub main_executable: String,
    pub target_processes: Vec<String>,
    pub service_name: String,
    pub backup_retention: usize,
    pub drain_delay: Duration,
    pub stop_timeout: Duration,
    pub restart_after_patch: bool,
}

impl From<&PatchSettings> for PatchEngineOptions {
    fn from(settings: &PatchSettings) -> Self {
        Self {
            app_dir: settings.app_dir.clone(),
            main_executable: settings.main_executable.clone(),
            target_processes: settings.target_processes.clone(),
            service_name: settings.service_name.clone(),
            backup_retention: settings.backup_retention,
            drain_delay: Duration::from_secs(settings.drain_delay_secs),
            stop_timeout: Duration::from_secs(settings.stop_timeout_secs),
            restart_after_patch: settings.restart_after_patch,
        }
    }
}

/// How a deployment ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOutcome {
    Succeeded,
    /// Ended before anything was overwritten
    Failed { step: PatchStep, reason: String },
    /// The live directory was restored from backup
    RolledBack { step: PatchStep, reason: String },
}

/// Runs deployments for one branch
pub struct PatchEngine {
    options: PatchEngineOptions,
    layout: StorageLayout,
    transfer: Arc<TransferService>,
    host: Arc<dyn HostControl>,
    status: Arc<dyn StatusSink>,
}

impl PatchEngine {
    pub fn new(
        options: PatchEngineOptions,
        layout: StorageLayout,
        transfer: Arc<TransferService>,
        host: Arc<dyn HostControl>,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        Self {
            options,
            layout,
            transfer,
            host,
            status,
        }
    }

    /// Run one deployment to completion. Never fails: every outcome is also
    /// published as a status event.
    ///
    /// `cancel` is honoured up to BACKUP; past that point the run always ends in
    /// COMPLETE or a rollback.
    pub async fn run(&self, request: PatchDeploymentRequest, cancel: &CancellationToken) -> PatchOutcome {
        let mut deployment = Deployment::new(self, request);
        info!(
            job_id = %deployment.job_id,
            patch_id = %deployment.request.patch_id,
            "Starting deployment"
        );

        let result = AssertUnwindSafe(deployment.execute(cancel)).catch_unwind().await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => deployment.unexpected(e.to_string()).await,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                deployment.unexpected(reason).await
            }
        };

        info!(job_id = %deployment.job_id, "Deployment finished: {:?}", outcome);
        outcome
    }

    /// Report a request that will never run as failed at its first step.
    pub async fn reject(&self, request: &PatchDeploymentRequest, reason: &str) {
        let event = StatusEvent::for_request(request, PatchStatus::Failed, request.step, 0, reason);
        self.status.publish(&event).await;
    }
}

/// State of one deployment run
struct Deployment<'a> {
    engine: &'a PatchEngine,
    request: PatchDeploymentRequest,
    job_id: String,
    tracker: PatchTracker,
    download: File,
    update_root: Dir,
    app_dir: Dir,
    backup: Option<Dir>,
}

impl<'a> Deployment<'a> {
    fn new(engine: &'a PatchEngine, request: PatchDeploymentRequest) -> Self {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| request.patch_id.clone());
        // One file per artifact so a resumed attempt continues the previous download
        let download = engine.layout.download_file(&request.patch_id);

        Self {
            engine,
            request,
            job_id,
            tracker: PatchTracker::new(),
            download,
            update_root: engine.layout.update_root(),
            app_dir: Dir::new(&engine.options.app_dir),
            backup: None,
        }
    }

    /// Record and publish. A transition the tracker rejects is a bug and
    /// surfaces as an unexpected error.
    async fn report(
        &mut self,
        status: PatchStatus,
        step: PatchStep,
        progress: u8,
        message: impl Into<String>,
    ) -> Result<(), AgentError> {
        let progress = self.tracker.record(status, step, progress)?;
        self.publish(status, step, progress, message.into()).await;
        Ok(())
    }

    /// Publish even if the tracker disagrees; used on failure paths so the
    /// outcome is never swallowed.
    async fn force_report(&mut self, status: PatchStatus, step: PatchStep, progress: u8, message: String) {
        let progress = match self.tracker.record(status, step, progress) {
            Ok(progress) => progress,
            Err(e) => {
                warn!(job_id = %self.job_id, "Publishing out-of-order status: {}", e);
                progress
            }
        };
        self.publish(status, step, progress, message).await;
    }

    async fn publish(&self, status: PatchStatus, step: PatchStep, progress: u8, message: String) {
        debug!(job_id = %self.job_id, "{}/{} {}% {}", status, step, progress, message);
        let event = StatusEvent::for_request(&self.request, status, step, progress, message);
        self.engine.status.publish(&event).await;
    }

    async fn execute(&mut self, cancel: &CancellationToken) -> Result<PatchOutcome, AgentError> {
        // DOWNLOAD
        self.begin(PatchStep::Download, "Downloading patch").await?;
        if self.request.step != PatchStep::Restart {
            // A full retry never trusts a partial file from an earlier attempt
            self.discard_download().await;
        }
        if let Err(reason) = self.download(cancel).await {
            return Ok(self.fail(PatchStep::Download, reason).await);
        }
        self.done(PatchStep::Download, "Download complete").await?;

        // VALIDATE
        self.begin(PatchStep::Validate, "Validating checksum").await?;
        match self.validate().await {
            Ok(message) => self.done(PatchStep::Validate, &message).await?,
            Err(reason) => {
                self.discard_download().await;
                return Ok(self.fail(PatchStep::Validate, reason).await);
            }
        }

        // EXTRACT
        if let Some(outcome) = self.cancelled(PatchStep::Extract, cancel).await {
            return Ok(outcome);
        }
        self.begin(PatchStep::Extract, "Extracting patch").await?;
        match self.extract().await {
            Ok(count) => self.done(PatchStep::Extract, &format!("Extracted {} files", count)).await?,
            Err(reason) => {
                self.discard_download().await;
                return Ok(self.fail(PatchStep::Extract, reason).await);
            }
        }

        // STOP_APP
        if let Some(outcome) = self.cancelled(PatchStep::StopApp, cancel).await {
            return Ok(outcome);
        }
        self.begin(PatchStep::StopApp, "Stopping application").await?;
        match self.stop_app().await {
            Ok(count) => self.done(PatchStep::StopApp, &format!("Stopped {} processes", count)).await?,
            Err(reason) => return Ok(self.fail(PatchStep::StopApp, reason).await),
        }

        // BACKUP
        if let Some(outcome) = self.cancelled(PatchStep::Backup, cancel).await {
            return Ok(outcome);
        }
        self.begin(PatchStep::Backup, "Backing up application").await?;
        match self.create_backup().await {
            Ok(backup) => {
                let message = format!("Backup created at {}", backup.path().display());
                self.backup = Some(backup);
                self.done(PatchStep::Backup, &message).await?;
            }
            Err(reason) => return Ok(self.fail(PatchStep::Backup, reason).await),
        }

        // UPDATE: from here on every failure rolls back
        self.begin(PatchStep::Update, "Updating application files").await?;
        match self.update_root.copy_into(&self.app_dir).await {
            Ok(count) => self.done(PatchStep::Update, &format!("Updated {} files", count)).await?,
            Err(e) => return Ok(self.rollback(PatchStep::Update, e.to_string()).await),
        }

        // START_APP only confirms the executable is in place
        match self.check_executable().await {
            Ok(()) => {
                self.report(
                    PatchStatus::Success,
                    PatchStep::StartApp,
                    done_progress(PatchStep::StartApp),
                    "Application executable present",
                )
                .await?
            }
            Err(reason) => return Ok(self.rollback(PatchStep::StartApp, reason).await),
        }

        // VERIFY
        self.begin(PatchStep::Verify, "Verifying installation").await?;
        match self.verify().await {
            Ok(()) => self.done(PatchStep::Verify, "Installation verified").await?,
            Err(reason) => return Ok(self.rollback(PatchStep::Verify, reason).await),
        }

        // CLEANUP is best-effort
        self.begin(PatchStep::Cleanup, "Cleaning up").await?;
        self.cleanup().await;

        // COMPLETE
        self.report(
            PatchStatus::Success,
            PatchStep::Complete,
            done_progress(PatchStep::Complete),
            "Patch applied successfully",
        )
        .await?;
        self.drain_then_restart().await;

        Ok(PatchOutcome::Succeeded)
    }

    async fn begin(&mut self, step: PatchStep, message: &str) -> Result<(), AgentError> {
        self.report(PatchStatus::InProgress, step, start_progress(step), message)
            .await
    }

    async fn done(&mut self, step: PatchStep, message: &str) -> Result<(), AgentError> {
        self.report(PatchStatus::Success, step, done_progress(step), message)
            .await
    }

    async fn fail(&mut self, step: PatchStep, reason: String) -> PatchOutcome {
        error!(job_id = %self.job_id, step = %step, "Deployment failed: {}", reason);
        let progress = self.tracker.progress();
        self.force_report(PatchStatus::Failed, step, progress, reason.clone())
            .await;
        PatchOutcome::Failed { step, reason }
    }

    async fn cancelled(&mut self, step: PatchStep, cancel: &CancellationToken) -> Option<PatchOutcome> {
        if cancel.is_cancelled() {
            // Report against the step that just finished
            let last = self.tracker.step();
            warn!(job_id = %self.job_id, "Cancelled before {}", step);
            Some(self.fail(last, format!("Cancelled before {}", step)).await)
        } else {
            None
        }
    }

    async fn download(&mut self, cancel: &CancellationToken) -> Result<(), String> {
        let sink = LogSink {
            label: format!("Download of {}", self.request.patch_id),
        };
        match self
            .engine
            .transfer
            .download(&self.request.patch_zip_path, self.download.path(), &sink, cancel)
            .await
        {
            Ok(TransferOutcome::Failed { reason }) => Err(reason),
            Ok(_) => Ok(()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn validate(&self) -> Result<String, String> {
        let expected = match self.request.expected_checksum.as_deref().map(str::trim) {
            Some(expected) if !expected.is_empty() => expected,
            _ => {
                info!(job_id = %self.job_id, "No checksum supplied, skipping validation");
                return Ok("Checksum not supplied, validation skipped".to_string());
            }
        };

        let actual = sha256_file(self.download.path())
            .await
            .map_err(|e| format!("Failed to hash artifact: {}", e))?;

        if checksums_match(expected, &actual) {
            Ok("Checksum verified".to_string())
        } else {
            Err(format!(
                "Checksum mismatch: expected {}, got {}",
                expected, actual
            ))
        }
    }

    async fn extract(&self) -> Result<usize, String> {
        self.update_root
            .recreate()
            .await
            .map_err(|e| format!("Failed to prepare update directory: {}", e))?;

        let count = extract_zip(self.download.path(), self.update_root.path())
            .await
            .map_err(|e| format!("Failed to extract archive: {}", e))?;

        if count == 0 {
            return Err("Archive contained no files".to_string());
        }
        Ok(count)
    }

    async fn stop_app(&self) -> Result<usize, String> {
        stop_processes(
            self.engine.host.as_ref(),
            &self.engine.options.target_processes,
            self.engine.options.stop_timeout,
        )
        .await
        .map_err(|e| e.to_string())
    }

    async fn create_backup(&self) -> Result<Dir, String> {
        if !self.app_dir.exists().await {
            return Err(format!(
                "Application directory {} does not exist",
                self.app_dir.path().display()
            ));
        }

        let name = format!(
            "{}_{}",
            Utc::now().format("%Y%m%d%H%M%S%3f"),
            sanitize(&self.request.patch_id)
        );
        let backup = self.engine.layout.backups_dir().subdir(&name);

        if let Err(e) = self.app_dir.copy_into(&backup).await {
            if let Err(cleanup) = backup.delete().await {
                warn!("Failed to remove partial backup: {}", cleanup);
            }
            return Err(format!("Backup failed: {}", e));
        }
        Ok(backup)
    }

    fn executable(&self) -> File {
        self.app_dir.file(&self.engine.options.main_executable)
    }

    async fn check_executable(&self) -> Result<(), String> {
        let executable = self.executable();
        match tokio::fs::metadata(executable.path()).await {
            Ok(metadata) if metadata.is_file() => Ok(()),
            _ => Err(format!(
                "Executable {} not found",
                executable.path().display()
            )),
        }
    }

    /// Executable in place and every updated file landed with the packaged size.
    async fn verify(&self) -> Result<(), String> {
        self.check_executable().await?;

        let files = self
            .update_root
            .walk_files()
            .await
            .map_err(|e| format!("Failed to list update files: {}", e))?;
        for relative in files {
            let packaged = File::new(self.update_root.path().join(&relative)).size().await;
            let installed = File::new(self.app_dir.path().join(&relative)).size().await;
            if installed.is_none() || installed != packaged {
                return Err(format!("{} was not installed correctly", relative.display()));
            }
        }
        Ok(())
    }

    async fn cleanup(&self) {
        if let Err(e) = self.download.delete().await {
            warn!("Failed to delete downloaded artifact: {}", e);
        }
        if let Err(e) = self.update_root.delete().await {
            warn!("Failed to clear update directory: {}", e);
        }
        if let Err(e) = self.prune_backups().await {
            warn!("Failed to prune backups: {}", e);
        }
    }

    async fn prune_backups(&self) -> Result<(), AgentError> {
        let backups_dir = self.engine.layout.backups_dir();
        if !backups_dir.exists().await {
            return Ok(());
        }

        // Names start with a sortable timestamp
        let mut backups = backups_dir.list_dirs().await?;
        backups.sort();

        let retention = self.engine.options.backup_retention;
        let excess = backups.len().saturating_sub(retention);
        for old in backups.into_iter().take(excess) {
            info!("Removing old backup {}", old.display());
            Dir::new(old).delete().await?;
        }
        Ok(())
    }

    async fn discard_download(&self) {
        if let Err(e) = self.download.delete().await {
            warn!("Failed to delete rejected artifact: {}", e);
        }
    }

    async fn rollback(&mut self, step: PatchStep, reason: String) -> PatchOutcome {
        error!(job_id = %self.job_id, step = %step, "Rolling back: {}", reason);
        self.force_report(
            PatchStatus::InProgress,
            PatchStep::Rollback,
            start_progress(PatchStep::Rollback),
            format!("Rolling back after {} failure: {}", step, reason),
        )
        .await;

        // Nothing should be running, but a half-started process would hold files
        if let Err(e) = self.stop_app().await {
            warn!("Failed to stop processes during rollback: {}", e);
        }

        let message = match self.restore().await {
            Ok(count) => format!(
                "Rolled back {} files after {} failure: {}",
                count, step, reason
            ),
            Err(e) => {
                error!(job_id = %self.job_id, "Rollback failed: {}", e);
                format!("Rollback failed ({}) after {} failure: {}", e, step, reason)
            }
        };

        self.force_report(PatchStatus::Rollback, PatchStep::Complete, 100, message)
            .await;

        // The branch must come back in a known state whatever the restore did
        self.drain_then_restart().await;

        PatchOutcome::RolledBack { step, reason }
    }

    /// Replace the live directory with the backup so the file set matches exactly.
    async fn restore(&self) -> Result<usize, AgentError> {
        let backup = self
            .backup
            .as_ref()
            .ok_or_else(|| AgentError::PatchError("No backup to restore".to_string()))?;
        self.app_dir.delete().await?;
        let count = backup.copy_into(&self.app_dir).await?;
        Ok(count)
    }

    async fn unexpected(&mut self, reason: String) -> PatchOutcome {
        error!(job_id = %self.job_id, "Unexpected error during deployment: {}", reason);
        let progress = self.tracker.progress();
        self.force_report(
            PatchStatus::Failed,
            PatchStep::Error,
            progress,
            format!("Unexpected error: {}", reason),
        )
        .await;

        if self.backup.is_some() {
            self.rollback(PatchStep::Error, reason).await
        } else {
            PatchOutcome::Failed {
                step: PatchStep::Error,
                reason,
            }
        }
    }

    async fn drain_then_restart(&self) {
        // Let the final status leave the outbound queue before the host goes down
        tokio::time::sleep(self.engine.options.drain_delay).await;

        if !self.engine.options.restart_after_patch {
            info!("Restart after patch disabled, skipping");
            return;
        }
        if let Err(e) = self
            .engine
            .host
            .schedule_restart(&self.engine.options.service_name)
            .await
        {
            error!("Failed to schedule restart: {}", e);
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}
