//! FanOut - 同じ application を `width` 個の SingleJob として並べる
//!
//! 子は親より先に作る（`FanOut::spawn`）。WAITING は fail-fast:
//! 終わった子が 1 つでも成功でなければ、残りを待たずに `ChildNode` で失敗する。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::single::{SingleJob, SingleJobPayload};
use crate::app::Engine;
use crate::domain::{Application, EngineError, StepError, TaskId};
use crate::typed::{Phase, StepContext, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanOutState {
    Waiting,
    Postprocess,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanOutSummary {
    pub children: usize,
    pub artifacts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutPayload {
    pub width: u32,
    pub application: Application,
    #[serde(default)]
    pub summary: Option<FanOutSummary>,
}

pub struct FanOut;

impl FanOut {
    /// Create `width` SingleJob children, then the FanOut that owns them.
    pub async fn spawn(
        engine: &Engine,
        width: u32,
        application: Application,
    ) -> Result<TaskId, EngineError> {
        let mut children = Vec::with_capacity(width as usize);
        for i in 0..width {
            let app = application.renamed(format!("{}-{i}", application.name));
            children.push(SingleJob::submit(engine, app).await?);
        }
        let payload = FanOutPayload {
            width,
            application,
            summary: None,
        };
        engine.create::<FanOut>(payload, children).await
    }
}

#[async_trait]
impl TaskKind for FanOut {
    const TYPE: &'static str = "bobbin.fan_out.v1";
    type State = FanOutState;
    type Payload = FanOutPayload;

    fn initial_state() -> Phase<FanOutState> {
        Phase::State(FanOutState::Waiting)
    }

    async fn handle(
        &self,
        state: FanOutState,
        ctx: &mut StepContext<Self>,
    ) -> Result<bool, StepError> {
        match state {
            FanOutState::Waiting => {
                if ctx.wait_children().await? {
                    ctx.goto(Phase::State(FanOutState::Postprocess));
                }
                Ok(false)
            }
            FanOutState::Postprocess => {
                let mut summary = FanOutSummary::default();
                for child in ctx.child_records().await? {
                    summary.children += 1;
                    match serde_json::from_value::<SingleJobPayload>(child.payload) {
                        Ok(payload) => summary.artifacts += payload.artifacts.len(),
                        Err(err) => warn!(task_id = %child.id, error = %err, "unreadable child payload"),
                    }
                }
                info!(task_id = %ctx.id(), children = summary.children, artifacts = summary.artifacts, "fan-out finished");
                ctx.payload.summary = Some(summary);
                ctx.goto(Phase::Complete);
                Ok(true)
            }
        }
    }
}
