//! Backend job model: handle, status and retrieved artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a job submitted to one backend.
///
/// `resource` names the backend that accepted the job; status, result and
/// cancel calls are routed back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub resource: String,
    pub lrms_job_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.lrms_job_id, self.resource)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Submitted,
    Running,
    /// Held or suspended on the backend; may still run.
    Stopped,
    Finished,
    Failed,
    Deleted,
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Deleted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Something produced by a job and collected by `get_results`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum Artifact {
    Stdout(String),
    Stderr(String),
    /// Path to an output file on the backend.
    FilePath(String),
    Json(serde_json::Value),
}
