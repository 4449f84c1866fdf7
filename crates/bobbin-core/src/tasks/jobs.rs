//! Backend 呼び出しの結果を handler 向けに分類する
//!
//! - `Transient` → `Pending`（state はそのまま、次のパスで再試行）
//! - `Authentication` → `Unreachable`（UNREACHABLE → NOTIFIED の経路へ）
//! - それ以外 → `Err`（task は ERROR）

use std::sync::Arc;

use tracing::{debug, warn};

use crate::app::Broker;
use crate::domain::{Application, Artifact, JobHandle, JobStatus, LrmsError, StepError};
use crate::ports::Lrms;

#[derive(Debug, Clone, PartialEq)]
pub enum Progress<T> {
    Done(T),
    /// Try again on the next pass.
    Pending,
    /// The backend refused our credentials.
    Unreachable,
}

fn classify<T>(result: Result<T, LrmsError>, what: &str) -> Result<Progress<T>, StepError> {
    match result {
        Ok(value) => Ok(Progress::Done(value)),
        Err(err) if err.is_transient() => {
            debug!(what, error = %err, "transient backend error, retrying next pass");
            Ok(Progress::Pending)
        }
        Err(LrmsError::Authentication(reason)) => {
            warn!(what, reason = %reason, "backend authentication failed");
            Ok(Progress::Unreachable)
        }
        Err(err) => Err(err.into()),
    }
}

fn backend_of(broker: &Broker, job: &JobHandle) -> Result<Arc<dyn Lrms>, StepError> {
    broker.backend(&job.resource).ok_or_else(|| {
        StepError::Lrms(LrmsError::Failed(format!(
            "job {job} belongs to unknown resource '{}'",
            job.resource
        )))
    })
}

/// Broker and submit to the best candidate.
pub async fn submit(broker: &Broker, app: &Application) -> Result<Progress<JobHandle>, StepError> {
    match broker.submit(app).await {
        Ok(job) => Ok(Progress::Done(job)),
        Err(StepError::Lrms(err)) => classify(Err(err), "submit"),
        Err(err) => Err(err),
    }
}

pub async fn status(broker: &Broker, job: &JobHandle) -> Result<Progress<JobStatus>, StepError> {
    let lrms = backend_of(broker, job)?;
    classify(lrms.check_status(job).await, "check_status")
}

pub async fn results(broker: &Broker, job: &JobHandle) -> Result<Progress<Vec<Artifact>>, StepError> {
    let lrms = backend_of(broker, job)?;
    classify(lrms.get_results(job).await, "get_results")
}

/// A job the backend no longer knows counts as cancelled.
pub async fn cancel(broker: &Broker, job: &JobHandle) -> Result<Progress<()>, StepError> {
    let lrms = backend_of(broker, job)?;
    match lrms.cancel(job).await {
        Err(LrmsError::UnknownJob(_)) => Ok(Progress::Done(())),
        other => classify(other, "cancel"),
    }
}

/// WAITING: keep waiting, move on, or fail.
///
/// Held, suspended and unrecognised jobs are polled again.
pub fn check_finished(job: &JobHandle, status: JobStatus) -> Result<bool, StepError> {
    match status {
        JobStatus::Submitted | JobStatus::Running => Ok(false),
        JobStatus::Stopped | JobStatus::Unknown => {
            debug!(job = %job, status = %status, "job is not progressing, polling again next pass");
            Ok(false)
        }
        JobStatus::Finished => Ok(true),
        JobStatus::Failed | JobStatus::Deleted => Err(StepError::JobFailed {
            job: job.to_string(),
            status,
        }),
    }
}
