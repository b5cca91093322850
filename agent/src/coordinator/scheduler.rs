//! Promotes due SCHEDULE enrollments into deployments

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::coordinator::presence::BranchPresence;
use crate::coordinator::service::{Coordinator, DeployOutcome};
use crate::errors::AgentError;

/// Counts from one scheduler pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub due: usize,
    pub started: usize,
    pub skipped_offline: usize,
    pub failed: usize,
}

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    presence: Arc<BranchPresence>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(coordinator: Arc<Coordinator>, presence: Arc<BranchPresence>, max_concurrent: usize) -> Self {
        Self {
            coordinator,
            presence,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Deploy every enrollment due at `now` whose branch is online.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Result<SchedulerReport, AgentError> {
        let due = self.coordinator.store().due_enrollments(now).await?;
        let mut report = SchedulerReport {
            due: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!("{} scheduled deployments due", due.len());

        let mut tasks = JoinSet::new();
        for enrollment in due {
            if !self.presence.is_online(&enrollment.branch_id) {
                debug!(
                    branch_id = %enrollment.branch_id,
                    "Branch offline, leaving {} scheduled",
                    enrollment.patch_id
                );
                report.skipped_offline += 1;
                continue;
            }

            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AgentError::Internal(e.to_string()))?;
            let coordinator = self.coordinator.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = coordinator
                    .deploy(&enrollment.branch_id, &enrollment.patch_id, &enrollment.user_id)
                    .await;
                (enrollment, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((enrollment, Ok(DeployOutcome::Initiated { job_id }))) => {
                    info!(
                        branch_id = %enrollment.branch_id,
                        job_id = %job_id,
                        "Scheduled deployment of {} started",
                        enrollment.patch_id
                    );
                    report.started += 1;
                }
                Ok((enrollment, Ok(other))) => {
                    debug!(
                        branch_id = %enrollment.branch_id,
                        "Scheduled deployment of {} not started: {:?}",
                        enrollment.patch_id,
                        other
                    );
                }
                Ok((enrollment, Err(e))) => {
                    warn!(
                        branch_id = %enrollment.branch_id,
                        "Scheduled deployment of {} failed: {}",
                        enrollment.patch_id,
                        e
                    );
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("Scheduled deployment task failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
