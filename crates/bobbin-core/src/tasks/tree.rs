//! TaskTree - 同じ kind の子を `depth` 段、各段 `branching` 個ずつ持つ木
//!
//! scheduler / backend の負荷試験用。葉は job を 1 つ投入して終了を待ち、
//! 内部ノードは子の完了を待つ。
//!
//! ```text
//! leaf:     READY ──submit──▶ SUBMITTED ──Finished──▶ COMPLETE
//! internal: READY ──────────▶ WAITING ──all children ok──▶ COMPLETE
//! ```

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::jobs::{self, Progress};
use crate::app::Engine;
use crate::domain::{Application, EngineError, JobHandle, JobStatus, StepError, TaskId};
use crate::typed::{Phase, StepContext, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskTreeState {
    Ready,
    Submitted,
    Waiting,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTreePayload {
    /// Levels below this node. 0 is a leaf.
    pub depth: u32,
    pub branching: u32,
    pub application: Application,
    #[serde(default)]
    pub job: Option<JobHandle>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
}

pub struct TaskTree;

type SpawnFuture<'a> = Pin<Box<dyn Future<Output = Result<TaskId, EngineError>> + Send + 'a>>;

impl TaskTree {
    /// Create the whole tree bottom-up and return the root.
    pub fn spawn(
        engine: &Engine,
        depth: u32,
        branching: u32,
        application: Application,
    ) -> SpawnFuture<'_> {
        Box::pin(async move {
            let mut children = Vec::new();
            if depth > 0 {
                for i in 0..branching {
                    let app = application.renamed(format!("{}.{i}", application.name));
                    children.push(Self::spawn(engine, depth - 1, branching, app).await?);
                }
            }
            let payload = TaskTreePayload {
                depth,
                branching,
                application,
                job: None,
                last_status: None,
            };
            engine.create::<TaskTree>(payload, children).await
        })
    }
}

#[async_trait]
impl TaskKind for TaskTree {
    const TYPE: &'static str = "bobbin.task_tree.v1";
    type State = TaskTreeState;
    type Payload = TaskTreePayload;

    fn initial_state() -> Phase<TaskTreeState> {
        Phase::State(TaskTreeState::Ready)
    }

    async fn handle(
        &self,
        state: TaskTreeState,
        ctx: &mut StepContext<Self>,
    ) -> Result<bool, StepError> {
        match state {
            TaskTreeState::Ready if !ctx.children().is_empty() => {
                ctx.goto(Phase::State(TaskTreeState::Waiting));
                Ok(false)
            }
            TaskTreeState::Ready => {
                let submitted = jobs::submit(ctx.broker(), &ctx.payload.application).await?;
                match submitted {
                    Progress::Done(job) => {
                        ctx.payload.job = Some(job);
                        ctx.payload.last_status = Some(JobStatus::Submitted);
                        ctx.goto(Phase::State(TaskTreeState::Submitted));
                    }
                    Progress::Pending => {}
                    Progress::Unreachable => {
                        warn!(task_id = %ctx.id(), "backend unreachable, retrying submission next pass");
                    }
                }
                Ok(false)
            }
            TaskTreeState::Submitted => {
                let job = ctx.payload.job.clone().ok_or_else(|| {
                    StepError::Payload(format!("task {} has no submitted job", ctx.id()))
                })?;
                let polled = jobs::status(ctx.broker(), &job).await?;
                let Progress::Done(status) = polled else {
                    return Ok(false);
                };
                ctx.payload.last_status = Some(status);
                if !jobs::check_finished(&job, status)? {
                    return Ok(false);
                }
                info!(task_id = %ctx.id(), job = %job, "leaf finished");
                ctx.goto(Phase::Complete);
                Ok(true)
            }
            TaskTreeState::Waiting => {
                if !ctx.wait_children().await? {
                    return Ok(false);
                }
                ctx.goto(Phase::Complete);
                Ok(true)
            }
        }
    }

    async fn kill(&self, ctx: &mut StepContext<Self>) -> Result<bool, StepError> {
        let Some(job) = ctx.payload.job.clone() else {
            return Ok(true);
        };
        if ctx.payload.last_status.is_some_and(|s| s.is_terminal()) {
            return Ok(true);
        }
        let cancelled = jobs::cancel(ctx.broker(), &job).await?;
        match cancelled {
            Progress::Done(()) => {
                ctx.payload.last_status = Some(JobStatus::Deleted);
                Ok(true)
            }
            Progress::Pending => Ok(false),
            Progress::Unreachable => Ok(true),
        }
    }
}
