//! Durable job, enrollment and artifact records

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use patch_protocol::{PatchStatus, PatchStep};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::AgentError;
use crate::filesys::file::File;

/// One attempt to apply one artifact to one branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentJob {
    pub job_id: String,
    pub branch_id: String,
    pub patch_id: String,
    pub user_id: String,
    pub attempt_count: u32,
    pub status: PatchStatus,
    pub step: PatchStep,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub progress_percent: u8,
}

impl DeploymentJob {
    /// Closed jobs accept no further status mutation.
    pub fn is_closed(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Upload pipeline stage of an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessLevel {
    Uploading,
    Merged,
    Ready,
    Failed,
}

/// A versioned installable package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchArtifact {
    pub patch_id: String,
    pub version: String,
    /// Path inside the remote artifact store
    pub zip_path: String,
    #[serde(default)]
    pub expected_checksum: Option<String>,
    pub process_level: ProcessLevel,
    #[serde(default = "default_patch_type")]
    pub patch_type: String,
}

fn default_patch_type() -> String {
    patch_protocol::PATCH_REQUEST_TYPE_APPLICATION.to_string()
}

/// One branch's relationship to one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchEnrollment {
    pub branch_id: String,
    pub patch_id: String,
    pub user_id: String,
    pub status: PatchStatus,
    pub step: PatchStep,
    #[serde(default)]
    pub attempt_count: u32,
    /// Current or last job
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// Bumped by the store on every write
    #[serde(default)]
    pub version: u64,
}

impl BranchEnrollment {
    pub fn new(branch_id: &str, patch_id: &str, user_id: &str) -> Self {
        Self {
            branch_id: branch_id.to_string(),
            patch_id: patch_id.to_string(),
            user_id: user_id.to_string(),
            status: PatchStatus::Init,
            step: PatchStep::Start,
            attempt_count: 0,
            job_id: None,
            start_time: None,
            end_time: None,
            scheduled_at: None,
            updated_at: Utc::now(),
            version: 0,
        }
    }

    /// A job has been dispatched and has not closed yet.
    ///
    /// Finished phases report `SUCCESS/<step>`, so only `end_time` marks a
    /// closed job.
    pub fn is_in_flight(&self) -> bool {
        self.job_id.is_some() && self.end_time.is_none() && self.status != PatchStatus::Schedule
    }

    pub fn is_deployed(&self) -> bool {
        self.status == PatchStatus::Success && self.step == PatchStep::Complete
    }
}

/// Record store used by the coordinator
///
/// Enrollments are unique per `(branch_id, patch_id)` and written with
/// compare-and-swap on [`BranchEnrollment::version`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn create_job(&self, job: DeploymentJob) -> Result<(), AgentError>;

    async fn update_job(&self, job: DeploymentJob) -> Result<(), AgentError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<DeploymentJob>, AgentError>;

    async fn get_enrollment(
        &self,
        branch_id: &str,
        patch_id: &str,
    ) -> Result<Option<BranchEnrollment>, AgentError>;

    /// Insert when `enrollment.version` is 0, otherwise replace the stored row
    /// only if its version still matches. Returns the row as stored.
    async fn upsert_enrollment(&self, enrollment: BranchEnrollment) -> Result<BranchEnrollment, AgentError>;

    /// SCHEDULE enrollments whose time has come, oldest first
    async fn due_enrollments(&self, now: DateTime<Utc>) -> Result<Vec<BranchEnrollment>, AgentError>;

    async fn get_artifact(&self, patch_id: &str) -> Result<Option<PatchArtifact>, AgentError>;

    async fn put_artifact(&self, artifact: PatchArtifact) -> Result<(), AgentError>;
}

type EnrollmentKey = (String, String);

#[derive(Default, Clone)]
struct Records {
    jobs: HashMap<String, DeploymentJob>,
    enrollments: HashMap<EnrollmentKey, BranchEnrollment>,
    artifacts: HashMap<String, PatchArtifact>,
}

/// On-disk shape of [`Records`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    jobs: Vec<DeploymentJob>,
    #[serde(default)]
    enrollments: Vec<BranchEnrollment>,
    #[serde(default)]
    artifacts: Vec<PatchArtifact>,
}

impl From<Snapshot> for Records {
    fn from(snapshot: Snapshot) -> Self {
        let mut records = Records::default();
        for job in snapshot.jobs {
            records.jobs.insert(job.job_id.clone(), job);
        }
        for enrollment in snapshot.enrollments {
            let key = (enrollment.branch_id.clone(), enrollment.patch_id.clone());
            match records.enrollments.get(&key) {
                Some(existing) if existing.version >= enrollment.version => {
                    warn!(
                        "Dropping duplicate enrollment for {}/{}",
                        enrollment.branch_id, enrollment.patch_id
                    );
                }
                _ => {
                    records.enrollments.insert(key, enrollment);
                }
            }
        }
        for artifact in snapshot.artifacts {
            records.artifacts.insert(artifact.patch_id.clone(), artifact);
        }
        records
    }
}

impl Records {
    fn snapshot(&self) -> Snapshot {
        let mut jobs: Vec<_> = self.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.job_id.cmp(&b.job_id)));
        let mut enrollments: Vec<_> = self.enrollments.values().cloned().collect();
        enrollments.sort_by(|a, b| (&a.branch_id, &a.patch_id).cmp(&(&b.branch_id, &b.patch_id)));
        let mut artifacts: Vec<_> = self.artifacts.values().cloned().collect();
        artifacts.sort_by(|a, b| a.patch_id.cmp(&b.patch_id));
        Snapshot {
            jobs,
            enrollments,
            artifacts,
        }
    }
}

/// [`RecordStore`] kept in memory and optionally mirrored to a JSON file
pub struct JsonRecordStore {
    records: Mutex<Records>,
    file: Option<File>,
}

impl JsonRecordStore {
    /// Store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            records: Mutex::new(Records::default()),
            file: None,
        }
    }

    /// Load `file` if it exists; every write rewrites it atomically.
    pub async fn open(file: File) -> Result<Self, AgentError> {
        let records = if file.exists().await {
            let snapshot: Snapshot = file
                .read_json()
                .await
                .map_err(|e| AgentError::StoreError(format!("Failed to load records: {}", e)))?;
            Records::from(snapshot)
        } else {
            Records::default()
        };

        debug!(
            "Loaded {} jobs and {} enrollments from {}",
            records.jobs.len(),
            records.enrollments.len(),
            file.path().display()
        );

        Ok(Self {
            records: Mutex::new(records),
            file: Some(file),
        })
    }

    /// Apply `change` to `records`, keeping it only once it is on disk.
    async fn commit(&self, records: &mut Records, change: impl FnOnce(&mut Records)) -> Result<(), AgentError> {
        let Some(file) = &self.file else {
            change(records);
            return Ok(());
        };

        let mut next = records.clone();
        change(&mut next);
        file.write_json(&next.snapshot())
            .await
            .map_err(|e| AgentError::StoreError(format!("Failed to persist records: {}", e)))?;
        *records = next;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn create_job(&self, job: DeploymentJob) -> Result<(), AgentError> {
        let mut records = self.records.lock().await;
        if records.jobs.contains_key(&job.job_id) {
            return Err(AgentError::Conflict(format!("Job {} already exists", job.job_id)));
        }
        self.commit(&mut records, |r| {
            r.jobs.insert(job.job_id.clone(), job);
        })
        .await
    }

    async fn update_job(&self, job: DeploymentJob) -> Result<(), AgentError> {
        let mut records = self.records.lock().await;
        if !records.jobs.contains_key(&job.job_id) {
            return Err(AgentError::NotFound(format!("Job {}", job.job_id)));
        }
        self.commit(&mut records, |r| {
            r.jobs.insert(job.job_id.clone(), job);
        })
        .await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<DeploymentJob>, AgentError> {
        Ok(self.records.lock().await.jobs.get(job_id).cloned())
    }

    async fn get_enrollment(
        &self,
        branch_id: &str,
        patch_id: &str,
    ) -> Result<Option<BranchEnrollment>, AgentError> {
        let key = (branch_id.to_string(), patch_id.to_string());
        Ok(self.records.lock().await.enrollments.get(&key).cloned())
    }

    async fn upsert_enrollment(&self, mut enrollment: BranchEnrollment) -> Result<BranchEnrollment, AgentError> {
        let mut records = self.records.lock().await;
        let key = (enrollment.branch_id.clone(), enrollment.patch_id.clone());

        let stored_version = records.enrollments.get(&key).map(|e| e.version);
        match stored_version {
            None if enrollment.version != 0 => {
                return Err(AgentError::NotFound(format!(
                    "Enrollment {}/{}",
                    enrollment.branch_id, enrollment.patch_id
                )));
            }
            Some(_) if enrollment.version == 0 => {
                return Err(AgentError::Conflict(format!(
                    "Enrollment {}/{} already exists",
                    enrollment.branch_id, enrollment.patch_id
                )));
            }
            Some(current) if current != enrollment.version => {
                return Err(AgentError::Conflict(format!(
                    "Enrollment {}/{} changed (version {} != {})",
                    enrollment.branch_id, enrollment.patch_id, current, enrollment.version
                )));
            }
            _ => {}
        }

        enrollment.version += 1;
        enrollment.updated_at = Utc::now();
        let stored = enrollment.clone();
        self.commit(&mut records, |r| {
            r.enrollments.insert(key, stored);
        })
        .await?;
        Ok(enrollment)
    }

    async fn due_enrollments(&self, now: DateTime<Utc>) -> Result<Vec<BranchEnrollment>, AgentError> {
        let records = self.records.lock().await;
        let mut due: Vec<_> = records
            .enrollments
            .values()
            .filter(|e| e.status == PatchStatus::Schedule)
            .filter(|e| e.scheduled_at.is_some_and(|at| at <= now))
            .cloned()
            .collect();
        due.sort_by_key(|e| e.scheduled_at);
        Ok(due)
    }

    async fn get_artifact(&self, patch_id: &str) -> Result<Option<PatchArtifact>, AgentError> {
        Ok(self.records.lock().await.artifacts.get(patch_id).cloned())
    }

    async fn put_artifact(&self, artifact: PatchArtifact) -> Result<(), AgentError> {
        let mut records = self.records.lock().await;
        if let Some(existing) = records.artifacts.get(&artifact.patch_id) {
            if existing.process_level == ProcessLevel::Ready && *existing != artifact {
                return Err(AgentError::Conflict(format!(
                    "Artifact {} is ready and can no longer change",
                    artifact.patch_id
                )));
            }
        }
        self.commit(&mut records, |r| {
            r.artifacts.insert(artifact.patch_id.clone(), artifact);
        })
        .await
    }
}
