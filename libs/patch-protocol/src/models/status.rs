//! Patch status and step enums

use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome-oriented status of a deployment. Orthogonal to [`PatchStep`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchStatus {
    Init,
    InProgress,
    Success,
    Failed,
    Rollback,
    Restart,
    Schedule,
}

impl PatchStatus {
    /// SUCCESS, FAILED and ROLLBACK end a deployment.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PatchStatus::Success | PatchStatus::Failed | PatchStatus::Rollback
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchStatus::Init => "INIT",
            PatchStatus::InProgress => "IN_PROGRESS",
            PatchStatus::Success => "SUCCESS",
            PatchStatus::Failed => "FAILED",
            PatchStatus::Rollback => "ROLLBACK",
            PatchStatus::Restart => "RESTART",
            PatchStatus::Schedule => "SCHEDULE",
        }
    }
}

impl fmt::Display for PatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase of the branch patch state machine.
///
/// Nominal order is `START → DOWNLOAD → VALIDATE → EXTRACT → STOP_APP → BACKUP →
/// UPDATE → START_APP → VERIFY → CLEANUP → COMPLETE`. `ROLLBACK` is reachable from
/// `UPDATE`, `START_APP`, `VERIFY` and `ERROR` and always ends in `COMPLETE`.
/// `RESTART` is only ever written by the coordinator when it re-arms an enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchStep {
    Start,
    Restart,
    Download,
    Validate,
    Extract,
    StopApp,
    Backup,
    Update,
    StartApp,
    Verify,
    Cleanup,
    Complete,
    Rollback,
    Error,
}

impl PatchStep {
    /// Whether the state machine may move from `self` to `next`.
    ///
    /// Staying on the same step is not a transition; see [`PatchStep::accepts`].
    pub fn can_advance_to(self, next: PatchStep) -> bool {
        use PatchStep::*;

        match (self, next) {
            (Start | Restart, Download) => true,
            (Download, Validate) => true,
            (Validate, Extract) => true,
            (Extract, StopApp) => true,
            (StopApp, Backup) => true,
            (Backup, Update) => true,
            (Update, StartApp) => true,
            (StartApp, Verify) => true,
            (Verify, Cleanup) => true,
            (Cleanup, Complete) => true,

            // Rollback branch
            (Update | StartApp | Verify | Error, Rollback) => true,
            (Rollback, Complete) => true,

            // Any live step can fail unexpectedly
            (Complete | Error, Error) => false,
            (_, Error) => true,

            _ => false,
        }
    }

    /// Whether an update reporting `next` is acceptable while sitting on `self`.
    pub fn accepts(self, next: PatchStep) -> bool {
        self == next || self.can_advance_to(next)
    }

    /// Steps that close the job-tracking record on the coordinator.
    pub fn closes_job(self) -> bool {
        matches!(self, PatchStep::Complete | PatchStep::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PatchStep::Start => "START",
            PatchStep::Restart => "RESTART",
            PatchStep::Download => "DOWNLOAD",
            PatchStep::Validate => "VALIDATE",
            PatchStep::Extract => "EXTRACT",
            PatchStep::StopApp => "STOP_APP",
            PatchStep::Backup => "BACKUP",
            PatchStep::Update => "UPDATE",
            PatchStep::StartApp => "START_APP",
            PatchStep::Verify => "VERIFY",
            PatchStep::Cleanup => "CLEANUP",
            PatchStep::Complete => "COMPLETE",
            PatchStep::Rollback => "ROLLBACK",
            PatchStep::Error => "ERROR",
        }
    }

    pub const ALL: [PatchStep; 14] = [
        PatchStep::Start,
        PatchStep::Restart,
        PatchStep::Download,
        PatchStep::Validate,
        PatchStep::Extract,
        PatchStep::StopApp,
        PatchStep::Backup,
        PatchStep::Update,
        PatchStep::StartApp,
        PatchStep::Verify,
        PatchStep::Cleanup,
        PatchStep::Complete,
        PatchStep::Rollback,
        PatchStep::Error,
    ];
}

impl fmt::Display for PatchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Branch presence, published retained on the service status topic and used as
/// the last-will payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceStatus {
    Online,
    Offline,
}

impl ServiceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceStatus::Online => "ONLINE",
            ServiceStatus::Offline => "OFFLINE",
        }
    }

    /// Parse a presence payload, accepting both the bare word and a JSON string.
    pub fn from_payload(payload: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(payload).ok()?.trim().trim_matches('"');
        match text.to_ascii_uppercase().as_str() {
            "ONLINE" => Some(ServiceStatus::Online),
            "OFFLINE" => Some(ServiceStatus::Offline),
            _ => None,
        }
    }
}
