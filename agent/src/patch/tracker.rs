//! Patch progress schedule and step bookkeeping

use patch_protocol::{PatchStatus, PatchStep};

use crate::errors::AgentError;

/// Progress published when a step starts
pub fn start_progress(step: PatchStep) -> u8 {
    match step {
        PatchStep::Start | PatchStep::Restart => 0,
        PatchStep::Download => 5,
        PatchStep::Validate => 20,
        PatchStep::Extract => 35,
        PatchStep::StopApp => 45,
        PatchStep::Backup => 60,
        PatchStep::Rollback => 65,
        PatchStep::Update => 78,
        PatchStep::StartApp => 85,
        PatchStep::Verify => 90,
        PatchStep::Cleanup => 95,
        PatchStep::Complete | PatchStep::Error => 100,
    }
}

/// Progress published when a step finishes successfully
pub fn done_progress(step: PatchStep) -> u8 {
    match step {
        PatchStep::Start | PatchStep::Restart => 0,
        PatchStep::Download => 15,
        PatchStep::Validate => 30,
        PatchStep::Extract => 40,
        PatchStep::StopApp => 55,
        PatchStep::Backup => 75,
        PatchStep::Update => 80,
        PatchStep::StartApp => 85,
        PatchStep::Verify => 92,
        PatchStep::Cleanup => 95,
        PatchStep::Rollback | PatchStep::Complete | PatchStep::Error => 100,
    }
}

/// Tracks where one deployment is in the state machine
#[derive(Debug, Clone)]
pub struct PatchTracker {
    step: PatchStep,
    status: PatchStatus,
    progress: u8,
}

impl Default for PatchTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PatchTracker {
    pub fn new() -> Self {
        Self {
            step: PatchStep::Start,
            status: PatchStatus::Init,
            progress: 0,
        }
    }

    pub fn step(&self) -> PatchStep {
        self.step
    }

    pub fn status(&self) -> PatchStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    /// Record a report, refusing transitions the step table does not allow.
    ///
    /// Progress never goes backwards except on the rollback and error branches.
    pub fn record(&mut self, status: PatchStatus, step: PatchStep, progress: u8) -> Result<u8, AgentError> {
        if self.step == PatchStep::Complete {
            return Err(AgentError::PatchError(format!(
                "Deployment already complete, refusing {}/{}",
                status, step
            )));
        }
        if !self.step.accepts(step) {
            return Err(AgentError::PatchError(format!(
                "Invalid step transition {} -> {}",
                self.step, step
            )));
        }

        let progress = match step {
            PatchStep::Rollback | PatchStep::Error => progress.min(100),
            _ => progress.clamp(self.progress, 100),
        };

        self.step = step;
        self.status = status;
        self.progress = progress;
        Ok(progress)
    }
}
