//! Control-plane coordinator
//!
//! Turns deploy requests into enrollment updates plus one published
//! [`PatchDeploymentRequest`], and folds the status events branches send back
//! into the job and enrollment records.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use patch_protocol::{PatchDeploymentRequest, PatchStatus, PatchStep, StatusEvent};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::coordinator::store::{
    BranchEnrollment, DeploymentJob, PatchArtifact, ProcessLevel, RecordStore,
};
use crate::errors::AgentError;
use crate::mqtt::policy::MessageClass;
use crate::mqtt::topics::Topics;
use crate::mqtt::transport::MqttTransport;
use crate::storage::settings::CoordinatorSettings;
use crate::transfer::path::normalize_remote_path;
use crate::utils::{generate_job_id, sha256_file};

/// Compare-and-swap retries before a write is reported as a conflict
const CAS_ATTEMPTS: u32 = 5;

/// Coordinator options
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Local directory holding the merged artifacts
    pub artifacts_root: PathBuf,
    /// Attempts after which a retry starts over instead of resuming
    pub attempt_threshold: u32,
    /// In-flight enrollments with no update for this long are retried
    pub stale_job_after: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from(&CoordinatorSettings::default())
    }
}

impl From<&CoordinatorSettings> for CoordinatorOptions {
    fn from(settings: &CoordinatorSettings) -> Self {
        Self {
            artifacts_root: settings.artifacts_root.clone(),
            attempt_threshold: settings.attempt_threshold.max(1),
            stale_job_after: Duration::from_secs(settings.stale_job_after_secs),
        }
    }
}

/// Result of deploying one artifact to one branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// A new job was created and its request published
    Initiated { job_id: String },
    /// A job for this branch and artifact is still running
    Attached { job_id: String },
    /// Nothing to do
    Skipped { reason: String },
}

/// Per-branch line of a multi-branch deploy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchResult {
    pub branch_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub message: String,
}

/// Aggregated outcome of a multi-branch deploy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub initiated: Vec<BranchResult>,
    pub failed: Vec<BranchResult>,
    pub skipped: Vec<BranchResult>,
}

/// What happened to an inbound status event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusDisposition {
    Applied { closed: bool },
    Ignored { reason: String },
}

impl StatusDisposition {
    fn ignored(reason: impl Into<String>) -> Self {
        StatusDisposition::Ignored {
            reason: reason.into(),
        }
    }
}

pub struct Coordinator {
    options: CoordinatorOptions,
    store: Arc<dyn RecordStore>,
    transport: MqttTransport,
}

impl Coordinator {
    pub fn new(options: CoordinatorOptions, store: Arc<dyn RecordStore>, transport: MqttTransport) -> Self {
        Self {
            options,
            store,
            transport,
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Deploy `patch_id` to one branch.
    ///
    /// An enrollment that already succeeded is skipped and a live one is
    /// attached to. Anything else is re-armed: RESTART while under the attempt
    /// threshold, a fresh START once it is reached.
    pub async fn deploy(&self, branch_id: &str, patch_id: &str, user_id: &str) -> Result<DeployOutcome, AgentError> {
        validate_id("branch id", branch_id)?;
        validate_id("patch id", patch_id)?;

        let artifact = self.ready_artifact(patch_id).await?;

        let mut last_conflict = None;
        for _ in 0..CAS_ATTEMPTS {
            match self.try_deploy(branch_id, &artifact, user_id).await {
                Err(AgentError::Conflict(reason)) => {
                    debug!("Enrollment {}/{} changed underneath, retrying", branch_id, patch_id);
                    last_conflict = Some(reason);
                }
                other => return other,
            }
        }
        Err(AgentError::Conflict(last_conflict.unwrap_or_default()))
    }

    async fn try_deploy(
        &self,
        branch_id: &str,
        artifact: &PatchArtifact,
        user_id: &str,
    ) -> Result<DeployOutcome, AgentError> {
        let now = Utc::now();
        let mut enrollment = match self.store.get_enrollment(branch_id, &artifact.patch_id).await? {
            Some(existing) if existing.is_deployed() => {
                return Ok(DeployOutcome::Skipped {
                    reason: format!("{} already deployed", artifact.patch_id),
                });
            }
            Some(existing) if existing.is_in_flight() && !self.is_stale(&existing, now) => {
                let job_id = existing.job_id.unwrap_or_default();
                info!(branch_id = %branch_id, job_id = %job_id, "Deployment already in flight, attaching");
                return Ok(DeployOutcome::Attached { job_id });
            }
            Some(existing) => existing,
            None => BranchEnrollment::new(branch_id, &artifact.patch_id, user_id),
        };
        let superseded = enrollment.is_in_flight().then(|| enrollment.job_id.clone()).flatten();

        self.rearm(&mut enrollment);

        let job_id = generate_job_id(branch_id);
        enrollment.job_id = Some(job_id.clone());
        enrollment.user_id = user_id.to_string();
        enrollment.start_time = Some(now);
        enrollment.end_time = None;
        enrollment.scheduled_at = None;

        // The job must exist before the enrollment points at it
        let job = DeploymentJob {
            job_id: job_id.clone(),
            branch_id: branch_id.to_string(),
            patch_id: artifact.patch_id.clone(),
            user_id: user_id.to_string(),
            attempt_count: enrollment.attempt_count,
            status: enrollment.status,
            step: enrollment.step,
            started_at: now,
            ended_at: None,
            message: String::new(),
            progress_percent: 0,
        };
        self.store.create_job(job.clone()).await?;

        let enrollment = match self.store.upsert_enrollment(enrollment).await {
            Ok(enrollment) => enrollment,
            Err(e) => {
                self.close_job(job, &format!("Enrollment not updated: {}", e)).await;
                return Err(e);
            }
        };
        if let Some(stale_job) = superseded {
            warn!(branch_id = %branch_id, job_id = %stale_job, "Closing stale job, superseded by {}", job_id);
            self.close_stale_job(&stale_job, &job_id).await;
        }

        let request = PatchDeploymentRequest {
            job_id: Some(job_id.clone()),
            user_id: user_id.to_string(),
            patch_id: artifact.patch_id.clone(),
            patch_zip_path: artifact.zip_path.clone(),
            expected_checksum: artifact.expected_checksum.clone(),
            status: enrollment.status,
            step: enrollment.step,
            request_type: artifact.patch_type.clone(),
        };

        let topic = Topics::patch_request(branch_id);
        if let Err(e) = self
            .transport
            .publish_class(MessageClass::PatchRequest, &topic, &request)
            .await
        {
            error!(branch_id = %branch_id, job_id = %job_id, "Failed to publish deployment request: {}", e);
            self.abandon(job, enrollment, &e.to_string()).await;
            return Err(e);
        }

        info!(
            branch_id = %branch_id,
            job_id = %job_id,
            attempt = %request_attempt(&request, &enrollment),
            "Deployment of {} initiated ({}/{})",
            artifact.patch_id,
            request.status,
            request.step
        );
        Ok(DeployOutcome::Initiated { job_id })
    }

    /// Apply the attempt policy to an enrollment about to get a new job.
    fn rearm(&self, enrollment: &mut BranchEnrollment) {
        let (attempt, status, step) = if enrollment.job_id.is_none() || enrollment.attempt_count == 0 {
            (1, PatchStatus::Init, PatchStep::Start)
        } else if enrollment.attempt_count < self.options.attempt_threshold {
            (enrollment.attempt_count + 1, PatchStatus::Restart, PatchStep::Restart)
        } else {
            (1, PatchStatus::Init, PatchStep::Start)
        };
        enrollment.attempt_count = attempt;
        enrollment.status = status;
        enrollment.step = step;
    }

    fn is_stale(&self, enrollment: &BranchEnrollment, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(enrollment.updated_at);
        idle.to_std().map(|idle| idle > self.options.stale_job_after).unwrap_or(false)
    }

    /// Mark a job whose request never left as failed so the enrollment is
    /// retryable.
    async fn abandon(&self, job: DeploymentJob, mut enrollment: BranchEnrollment, reason: &str) {
        self.close_job(job, &format!("Failed to publish request: {}", reason)).await;

        enrollment.status = PatchStatus::Failed;
        enrollment.end_time = Some(Utc::now());
        if let Err(e) = self.store.upsert_enrollment(enrollment).await {
            warn!("Failed to mark enrollment as failed: {}", e);
        }
    }

    async fn close_stale_job(&self, job_id: &str, superseded_by: &str) {
        match self.store.get_job(job_id).await {
            Ok(Some(job)) if !job.is_closed() => {
                self.close_job(job, &format!("Superseded by {}", superseded_by)).await;
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to load stale job {}: {}", job_id, e),
        }
    }

    /// Mark a job that will never run as failed.
    async fn close_job(&self, mut job: DeploymentJob, message: &str) {
        job.status = PatchStatus::Failed;
        job.message = message.to_string();
        job.ended_at = Some(Utc::now());
        if let Err(e) = self.store.update_job(job).await {
            warn!("Failed to mark job as failed: {}", e);
        }
    }

    /// Deploy to every branch independently and summarise.
    pub async fn deploy_many(&self, branch_ids: &[String], patch_id: &str, user_id: &str) -> DeploymentSummary {
        let mut summary = DeploymentSummary::default();

        for branch_id in branch_ids {
            match self.deploy(branch_id, patch_id, user_id).await {
                Ok(DeployOutcome::Initiated { job_id }) => summary.initiated.push(BranchResult {
                    branch_id: branch_id.clone(),
                    job_id: Some(job_id),
                    message: "Deployment initiated".to_string(),
                }),
                Ok(DeployOutcome::Attached { job_id }) => summary.initiated.push(BranchResult {
                    branch_id: branch_id.clone(),
                    job_id: Some(job_id),
                    message: "Deployment already in progress".to_string(),
                }),
                Ok(DeployOutcome::Skipped { reason }) => summary.skipped.push(BranchResult {
                    branch_id: branch_id.clone(),
                    job_id: None,
                    message: reason,
                }),
                Err(e) => {
                    warn!(branch_id = %branch_id, "Deployment of {} failed: {}", patch_id, e);
                    summary.failed.push(BranchResult {
                        branch_id: branch_id.clone(),
                        job_id: None,
                        message: e.to_string(),
                    })
                }
            }
        }

        info!(
            "Deployment of {}: {} initiated, {} failed, {} skipped",
            patch_id,
            summary.initiated.len(),
            summary.failed.len(),
            summary.skipped.len()
        );
        summary
    }

    /// Defer a deployment until `at`; the scheduler picks it up from there.
    pub async fn schedule(
        &self,
        branch_id: &str,
        patch_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<BranchEnrollment, AgentError> {
        validate_id("branch id", branch_id)?;
        validate_id("patch id", patch_id)?;
        if self.store.get_artifact(patch_id).await?.is_none() {
            return Err(AgentError::NotFound(format!("Artifact {}", patch_id)));
        }

        for _ in 0..CAS_ATTEMPTS {
            let now = Utc::now();
            let mut enrollment = match self.store.get_enrollment(branch_id, patch_id).await? {
                Some(existing) if existing.is_deployed() => {
                    return Err(AgentError::Conflict(format!(
                        "{} is already deployed to {}",
                        patch_id, branch_id
                    )));
                }
                Some(existing) if existing.is_in_flight() && !self.is_stale(&existing, now) => {
                    return Err(AgentError::Conflict(format!(
                        "A deployment of {} to {} is in progress",
                        patch_id, branch_id
                    )));
                }
                Some(existing) => existing,
                None => BranchEnrollment::new(branch_id, patch_id, user_id),
            };

            enrollment.status = PatchStatus::Schedule;
            enrollment.user_id = user_id.to_string();
            enrollment.scheduled_at = Some(at);

            match self.store.upsert_enrollment(enrollment).await {
                Err(AgentError::Conflict(_)) => continue,
                Ok(stored) => {
                    info!(branch_id = %branch_id, "Scheduled {} for {}", patch_id, at);
                    return Ok(stored);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AgentError::Conflict(format!(
            "Enrollment {}/{} kept changing",
            branch_id, patch_id
        )))
    }

    /// Fold one status event from `branch_id` into the job and enrollment.
    pub async fn handle_status(&self, branch_id: &str, event: StatusEvent) -> Result<StatusDisposition, AgentError> {
        let enrollment = self.store.get_enrollment(branch_id, &event.patch_id).await?;

        // Older agents do not echo the job id; fall back to the enrollment's
        let job_id = match event
            .job_id
            .clone()
            .or_else(|| enrollment.as_ref().and_then(|e| e.job_id.clone()))
        {
            Some(job_id) => job_id,
            None => return Ok(StatusDisposition::ignored("no job for event")),
        };

        let mut job = match self.store.get_job(&job_id).await? {
            Some(job) => job,
            None => return Ok(StatusDisposition::ignored(format!("unknown job {}", job_id))),
        };
        if job.branch_id != branch_id || job.patch_id != event.patch_id {
            return Ok(StatusDisposition::ignored(format!(
                "job {} belongs to {}/{}",
                job_id, job.branch_id, job.patch_id
            )));
        }
        if job.is_closed() {
            return Ok(StatusDisposition::ignored(format!("job {} is closed", job_id)));
        }
        if !job.step.accepts(event.step) {
            warn!(
                branch_id = %branch_id,
                job_id = %job_id,
                "Rejecting transition {} -> {}",
                job.step,
                event.step
            );
            return Ok(StatusDisposition::ignored(format!(
                "invalid transition {} -> {}",
                job.step, event.step
            )));
        }

        let closes = event.is_terminal();
        let now = Utc::now();
        job.status = event.status;
        job.step = event.step;
        job.message = event.message.clone();
        job.progress_percent = event.progress_percent;
        if closes {
            job.ended_at = Some(now);
        }
        self.store.update_job(job).await?;

        self.apply_to_enrollment(branch_id, &job_id, &event, closes).await?;

        if closes {
            info!(
                branch_id = %branch_id,
                job_id = %job_id,
                "Job closed with {}/{}: {}",
                event.status,
                event.step,
                event.message
            );
        } else {
            debug!(
                branch_id = %branch_id,
                job_id = %job_id,
                "{}/{} ({}%)",
                event.status,
                event.step,
                event.progress_percent
            );
        }
        Ok(StatusDisposition::Applied { closed: closes })
    }

    async fn apply_to_enrollment(
        &self,
        branch_id: &str,
        job_id: &str,
        event: &StatusEvent,
        closes: bool,
    ) -> Result<(), AgentError> {
        for _ in 0..CAS_ATTEMPTS {
            let mut enrollment = match self.store.get_enrollment(branch_id, &event.patch_id).await? {
                Some(enrollment) => enrollment,
                None => return Ok(()),
            };
            // Superseded attempts only update their own job
            if enrollment.job_id.as_deref() != Some(job_id) {
                debug!(branch_id = %branch_id, job_id = %job_id, "Enrollment moved on to another job");
                return Ok(());
            }

            enrollment.status = event.status;
            enrollment.step = event.step;
            if closes {
                enrollment.end_time = Some(event.timestamp);
            }

            match self.store.upsert_enrollment(enrollment).await {
                Err(AgentError::Conflict(_)) => continue,
                other => return other.map(|_| ()),
            }
        }
        Err(AgentError::Conflict(format!(
            "Enrollment {}/{} kept changing",
            branch_id, event.patch_id
        )))
    }

    /// The artifact with its checksum computed once from the merged file.
    async fn ready_artifact(&self, patch_id: &str) -> Result<PatchArtifact, AgentError> {
        let mut artifact = self
            .store
            .get_artifact(patch_id)
            .await?
            .ok_or_else(|| AgentError::NotFound(format!("Artifact {}", patch_id)))?;

        match artifact.process_level {
            ProcessLevel::Ready => {
                if artifact.expected_checksum.is_none() {
                    warn!("Artifact {} has no checksum, branches will skip validation", patch_id);
                }
                Ok(artifact)
            }
            ProcessLevel::Merged => {
                let path = self.artifact_path(&artifact.zip_path);
                let checksum = sha256_file(&path).await.map_err(|e| {
                    AgentError::ValidationError(format!(
                        "Failed to checksum {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                info!("Computed checksum for {}: {}", patch_id, checksum);

                artifact.expected_checksum = Some(checksum);
                artifact.process_level = ProcessLevel::Ready;
                self.store.put_artifact(artifact.clone()).await?;
                Ok(artifact)
            }
            ProcessLevel::Uploading | ProcessLevel::Failed => Err(AgentError::ValidationError(format!(
                "Artifact {} is not ready ({:?})",
                patch_id, artifact.process_level
            ))),
        }
    }

    fn artifact_path(&self, zip_path: &str) -> PathBuf {
        let normalized = normalize_remote_path(zip_path);
        self.options
            .artifacts_root
            .join(normalized.trim_start_matches('/'))
    }
}

fn request_attempt(request: &PatchDeploymentRequest, enrollment: &BranchEnrollment) -> String {
    let kind = if request.step == PatchStep::Restart { "resume" } else { "full" };
    format!("{} ({})", enrollment.attempt_count, kind)
}

fn validate_id(what: &str, value: &str) -> Result<(), AgentError> {
    let valid = !value.is_empty()
        && !value.contains(['/', '+', '#'])
        && !value.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err(AgentError::ValidationError(format!("Invalid {}: {:?}", what, value)))
    }
}
