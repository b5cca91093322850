//! Agent side of `branch/{id}/PATCH/Application`

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use patch_protocol::{PatchDeploymentRequest, PATCH_REQUEST_TYPE_APPLICATION};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::AgentError;
use crate::mqtt::broker::MqttMessage;
use crate::mqtt::dispatch::MessageHandler;
use crate::patch::engine::{PatchEngine, PatchOutcome};

/// What the listener did with a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDecision {
    Started { job_id: String },
    /// Redelivery of the job that is already running
    Duplicate { job_id: String },
    /// Another job holds the branch
    Busy { active_job: String },
}

/// Starts one [`PatchEngine`] run per request, never two at once.
pub struct PatchListener {
    engine: Arc<PatchEngine>,
    cancel: CancellationToken,
    active: Arc<Mutex<Option<String>>>,
    tasks: Mutex<Vec<JoinHandle<PatchOutcome>>>,
}

impl PatchListener {
    pub fn new(engine: Arc<PatchEngine>, cancel: CancellationToken) -> Self {
        Self {
            engine,
            cancel,
            active: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Job currently running on this branch
    pub fn active_job(&self) -> Option<String> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn start(&self, request: PatchDeploymentRequest) -> StartDecision {
        let job_id = request
            .job_id
            .clone()
            .unwrap_or_else(|| request.patch_id.clone());

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = active.as_ref() {
            return if *current == job_id {
                StartDecision::Duplicate { job_id }
            } else {
                StartDecision::Busy {
                    active_job: current.clone(),
                }
            };
        }
        *active = Some(job_id.clone());

        let engine = self.engine.clone();
        let cancel = self.cancel.clone();
        let slot = self.active.clone();
        let running = job_id.clone();
        let handle = tokio::spawn(async move {
            let outcome = engine.run(request, &cancel).await;
            let mut active = slot.lock().unwrap_or_else(|e| e.into_inner());
            if active.as_deref() == Some(running.as_str()) {
                *active = None;
            }
            outcome
        });

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);

        StartDecision::Started { job_id }
    }

    /// Wait for every started run and return their outcomes.
    pub async fn wait_idle(&self) -> Vec<PatchOutcome> {
        let tasks: Vec<_> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };

        let mut outcomes = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!("Patch task ended abnormally: {}", e),
            }
        }
        outcomes
    }

    /// Cancel the running job where that is still safe and wait up to `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(timeout, self.wait_idle()).await.is_err() {
            warn!("Patch job still running after {:?}, leaving it", timeout);
        }
    }
}

#[async_trait]
impl MessageHandler for PatchListener {
    async fn handle(&self, message: MqttMessage) -> Result<(), AgentError> {
        let request: PatchDeploymentRequest = message.parse_json()?;

        if request.request_type != PATCH_REQUEST_TYPE_APPLICATION {
            return Err(AgentError::ValidationError(format!(
                "Unsupported patch request type {}",
                request.request_type
            )));
        }
        if request.patch_zip_path.trim().is_empty() {
            return Err(AgentError::ValidationError(format!(
                "Request for {} has no artifact path",
                request.patch_id
            )));
        }

        let patch_id = request.patch_id.clone();
        match self.start(request.clone()) {
            StartDecision::Started { job_id } => {
                info!(job_id = %job_id, "Accepted deployment of {}", patch_id)
            }
            StartDecision::Duplicate { job_id } => {
                info!(job_id = %job_id, "Ignoring redelivered request for {}", patch_id)
            }
            StartDecision::Busy { active_job } => {
                warn!(
                    active_job = %active_job,
                    "Rejecting deployment of {} while another job is running",
                    patch_id
                );
                // Close the rejected job on the coordinator
                let reason = format!("Branch is busy with job {}", active_job);
                self.engine.reject(&request, &reason).await;
            }
        }
        Ok(())
    }
}
