//! SingleJob - 1 つの application を 1 つの backend job として実行する
//!
//! ```text
//! READY ──submit──▶ WAITING ──Finished──▶ RETRIEVING ──▶ POSTPROCESS ──▶ COMPLETE
//!   │                 │  ▲
//!   │ auth            │  │ poll ok
//!   ▼                 ▼  │
//! UNREACHABLE ──────▶ NOTIFIED
//! ```
//!
//! Transient な backend エラーでは state を変えずに次のパスを待つ。
//! KILL は投入済みの job があれば backend に cancel を出す。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::jobs::{self, Progress};
use crate::app::Engine;
use crate::domain::{Application, Artifact, EngineError, JobHandle, JobStatus, StepError, TaskId};
use crate::typed::{Phase, StepContext, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SingleJobState {
    Ready,
    Waiting,
    Retrieving,
    Unreachable,
    Notified,
    Postprocess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleJobPayload {
    pub application: Application,
    #[serde(default)]
    pub job: Option<JobHandle>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SingleJobPayload {
    pub fn new(application: Application) -> Self {
        Self {
            application,
            job: None,
            last_status: None,
            artifacts: Vec::new(),
            completed_at: None,
        }
    }
}

pub struct SingleJob;

impl SingleJob {
    pub async fn submit(engine: &Engine, application: Application) -> Result<TaskId, EngineError> {
        engine
            .create::<SingleJob>(SingleJobPayload::new(application), Vec::new())
            .await
    }
}

fn recorded_job(ctx: &StepContext<SingleJob>) -> Result<JobHandle, StepError> {
    ctx.payload
        .job
        .clone()
        .ok_or_else(|| StepError::Payload(format!("task {} has no submitted job", ctx.id())))
}

type Ctx = StepContext<SingleJob>;

#[async_trait]
impl TaskKind for SingleJob {
    const TYPE: &'static str = "bobbin.single_job.v1";
    type State = SingleJobState;
    type Payload = SingleJobPayload;

    fn initial_state() -> Phase<SingleJobState> {
        Phase::State(SingleJobState::Ready)
    }

    async fn handle(&self, state: SingleJobState, ctx: &mut Ctx) -> Result<bool, StepError> {
        match state {
            SingleJobState::Ready => {
                let submitted = jobs::submit(ctx.broker(), &ctx.payload.application).await?;
                match submitted {
                    Progress::Done(job) => {
                        info!(task_id = %ctx.id(), job = %job, "job submitted");
                        ctx.payload.job = Some(job);
                        ctx.payload.last_status = Some(JobStatus::Submitted);
                        ctx.goto(Phase::State(SingleJobState::Waiting));
                    }
                    Progress::Pending => {}
                    Progress::Unreachable => ctx.goto(Phase::State(SingleJobState::Unreachable)),
                }
                Ok(false)
            }
            SingleJobState::Waiting => {
                let job = recorded_job(ctx)?;
                let polled = jobs::status(ctx.broker(), &job).await?;
                match polled {
                    Progress::Done(status) => {
                        ctx.payload.last_status = Some(status);
                        if jobs::check_finished(&job, status)? {
                            ctx.goto(Phase::State(SingleJobState::Retrieving));
                        }
                    }
                    Progress::Pending => {}
                    Progress::Unreachable => ctx.goto(Phase::State(SingleJobState::Unreachable)),
                }
                Ok(false)
            }
            SingleJobState::Retrieving => {
                let job = recorded_job(ctx)?;
                let fetched = jobs::results(ctx.broker(), &job).await?;
                match fetched {
                    Progress::Done(artifacts) => {
                        info!(task_id = %ctx.id(), job = %job, artifacts = artifacts.len(), "results retrieved");
                        ctx.payload.artifacts = artifacts;
                        ctx.goto(Phase::State(SingleJobState::Postprocess));
                    }
                    Progress::Pending => {}
                    Progress::Unreachable => ctx.goto(Phase::State(SingleJobState::Unreachable)),
                }
                Ok(false)
            }
            SingleJobState::Unreachable => {
                // No notification channel; the log line is the notice.
                warn!(task_id = %ctx.id(), "backend credentials need to be renewed");
                ctx.goto(Phase::State(SingleJobState::Notified));
                Ok(false)
            }
            SingleJobState::Notified => {
                let Some(job) = ctx.payload.job.clone() else {
                    ctx.goto(Phase::State(SingleJobState::Ready));
                    return Ok(false);
                };
                let polled = jobs::status(ctx.broker(), &job).await?;
                if let Progress::Done(status) = polled {
                    ctx.payload.last_status = Some(status);
                    ctx.goto(Phase::State(SingleJobState::Waiting));
                }
                Ok(false)
            }
            SingleJobState::Postprocess => {
                ctx.payload.completed_at = Some(ctx.now());
                ctx.goto(Phase::Complete);
                Ok(true)
            }
        }
    }

    async fn kill(&self, ctx: &mut Ctx) -> Result<bool, StepError> {
        let Some(job) = ctx.payload.job.clone() else {
            return Ok(true);
        };
        if ctx.payload.last_status.is_some_and(|s| s.is_terminal()) {
            return Ok(true);
        }
        let cancelled = jobs::cancel(ctx.broker(), &job).await?;
        match cancelled {
            Progress::Done(()) => {
                info!(task_id = %ctx.id(), job = %job, "job cancelled");
                ctx.payload.last_status = Some(JobStatus::Deleted);
                Ok(true)
            }
            Progress::Pending => Ok(false),
            Progress::Unreachable => {
                warn!(task_id = %ctx.id(), job = %job, "cannot reach backend to cancel, giving up");
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LrmsError, StateName, Transition};
    use crate::impls::SimulatedResource;
    use crate::ports::{Clock, Lrms};
    use crate::testing::Harness;

    fn app() -> Application {
        Application::new("hello", "/bin/echo").with_args(["hi"])
    }

    async fn payload(h: &Harness, id: TaskId) -> SingleJobPayload {
        serde_json::from_value(h.load(id).await.payload).unwrap()
    }

    async fn state(h: &Harness, id: TaskId) -> StateName {
        h.load(id).await.state
    }

    #[tokio::test]
    async fn walks_through_every_state_to_complete() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();

        let expected = ["WAITING", "WAITING", "RETRIEVING", "POSTPROCESS", "COMPLETE"];
        for name in expected {
            h.engine.step(id).await.unwrap();
            assert_eq!(state(&h, id).await, StateName::new(name));
        }

        let record = h.load(id).await;
        assert_eq!(record.transition, Transition::Complete);
        let payload = payload(&h, id).await;
        assert_eq!(payload.artifacts.len(), 2);
        assert_eq!(payload.last_status, Some(JobStatus::Finished));
        assert_eq!(payload.completed_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn failed_job_moves_task_to_error() {
        let h = Harness::with_resource(SimulatedResource {
            polls_to_finish: 1,
            fail_jobs: true,
            ..SimulatedResource::localhost()
        });
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();

        let record = h.engine.run(id).await.unwrap();
        assert_eq!(record.transition, Transition::Error);
        assert_eq!(record.state, StateName::new("WAITING"));
        assert!(record.last_error.unwrap().contains("ended as Failed"));
    }

    #[tokio::test]
    async fn transient_status_error_keeps_waiting() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();
        h.engine.step(id).await.unwrap();

        h.lrms.fail_next_status(LrmsError::Transient("timeout".into())).await;
        h.engine.step(id).await.unwrap();

        let record = h.load(id).await;
        assert_eq!(record.state, StateName::new("WAITING"));
        assert_eq!(record.transition, Transition::Paused);
    }

    #[tokio::test]
    async fn authentication_failure_goes_through_notified() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();
        h.engine.step(id).await.unwrap();

        h.lrms.fail_next_status(LrmsError::Authentication("expired".into())).await;
        h.engine.step(id).await.unwrap();
        assert_eq!(state(&h, id).await, StateName::new("UNREACHABLE"));

        h.engine.step(id).await.unwrap();
        assert_eq!(state(&h, id).await, StateName::new("NOTIFIED"));

        h.lrms.fail_next_status(LrmsError::Authentication("still expired".into())).await;
        h.engine.step(id).await.unwrap();
        assert_eq!(state(&h, id).await, StateName::new("NOTIFIED"));

        h.engine.step(id).await.unwrap();
        assert_eq!(state(&h, id).await, StateName::new("WAITING"));
    }

    #[tokio::test]
    async fn refused_submission_without_job_returns_to_ready() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();
        h.lrms.fail_next_submit(LrmsError::Authentication("expired".into())).await;

        for name in ["UNREACHABLE", "NOTIFIED", "READY", "WAITING"] {
            h.engine.step(id).await.unwrap();
            assert_eq!(state(&h, id).await, StateName::new(name));
        }
    }

    #[tokio::test]
    async fn oversized_application_has_no_resources() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app().with_cores(64)).await.unwrap();
        h.engine.step(id).await.unwrap();

        let record = h.load(id).await;
        assert_eq!(record.transition, Transition::Error);
        assert!(record.last_error.unwrap().contains("no resource accepted"));
    }

    #[tokio::test]
    async fn kill_cancels_the_backend_job() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();
        h.engine.step(id).await.unwrap();
        let job = payload(&h, id).await.job.unwrap();

        h.engine.control().kill(id).await.unwrap();
        h.engine.step(id).await.unwrap();

        let record = h.load(id).await;
        assert_eq!(record.state, StateName::kill());
        assert_eq!(record.transition, Transition::Complete);
        assert!(!record.successful(&StateName::complete()));
        assert_eq!(h.lrms.check_status(&job).await.unwrap(), JobStatus::Deleted);
    }

    #[tokio::test]
    async fn kill_before_submission_just_completes() {
        let h = Harness::new();
        let id = SingleJob::submit(&h.engine, app()).await.unwrap();
        h.engine.control().kill(id).await.unwrap();
        h.engine.step(id).await.unwrap();

        assert_eq!(h.load(id).await.transition, Transition::Complete);
        assert_eq!(h.lrms.job_count().await, 0);
    }
}
