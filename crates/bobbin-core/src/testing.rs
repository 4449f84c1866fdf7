//! テスト用の kind と組み立て済みの engine

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::app::{Engine, EngineBuilder, Scheduler};
use crate::config::EngineConfig;
use crate::domain::{StateName, StepError, TaskId, TaskRecord, TaskType};
use crate::impls::{InMemoryTaskStore, SimulatedLrms, SimulatedResource};
use crate::ports::{Clock, FixedClock, Lrms};
use crate::typed::{Phase, StepContext, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepsState {
    Ready,
    Working,
    /// Declared but deliberately unhandled.
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepsPayload {
    /// WORKING steps before completing.
    pub remaining: u32,
    pub start_done: bool,
    pub fail: bool,
    pub panic: bool,
    pub sleep_ms: u64,
}

/// READY → WORKING (×`remaining`) → COMPLETE
pub struct Steps;

#[async_trait]
impl TaskKind for Steps {
    const TYPE: &'static str = "test.steps.v1";
    type State = StepsState;
    type Payload = StepsPayload;

    fn initial_state() -> Phase<StepsState> {
        Phase::State(StepsState::Ready)
    }

    async fn handle(
        &self,
        state: StepsState,
        ctx: &mut StepContext<Self>,
    ) -> Result<bool, StepError> {
        match state {
            StepsState::Ready => {
                if ctx.payload.fail {
                    return Err(StepError::Payload("asked to fail".into()));
                }
                if ctx.payload.panic {
                    panic!("asked to panic");
                }
                if ctx.payload.sleep_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(ctx.payload.sleep_ms)).await;
                }
                if ctx.payload.start_done {
                    ctx.goto(Phase::Complete);
                    return Ok(true);
                }
                ctx.goto(Phase::State(StepsState::Working));
                Ok(false)
            }
            StepsState::Working if ctx.payload.remaining == 0 => {
                ctx.goto(Phase::Complete);
                Ok(true)
            }
            StepsState::Working => {
                ctx.payload.remaining -= 1;
                Ok(false)
            }
            StepsState::Orphan => Err(StepError::UnhandledState {
                task_type: TaskType::new(Self::TYPE),
                state: StateName::new("ORPHAN"),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatherState {
    Waiting,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatherPayload {
    /// Report completion without looking at the children.
    pub finish_early: bool,
}

/// Waits for its children, then completes.
pub struct Gather;

#[async_trait]
impl TaskKind for Gather {
    const TYPE: &'static str = "test.gather.v1";
    type State = GatherState;
    type Payload = GatherPayload;

    fn initial_state() -> Phase<GatherState> {
        Phase::State(GatherState::Waiting)
    }

    async fn handle(
        &self,
        _state: GatherState,
        ctx: &mut StepContext<Self>,
    ) -> Result<bool, StepError> {
        if !ctx.payload.finish_early && !ctx.wait_children().await? {
            return Ok(false);
        }
        ctx.goto(Phase::Complete);
        Ok(true)
    }
}

pub struct Harness {
    pub engine: Arc<Engine>,
    pub clock: Arc<FixedClock>,
    pub lrms: Arc<SimulatedLrms>,
}

impl Harness {
    /// No sleeping between `run` rounds, fast lock polling.
    pub fn config() -> EngineConfig {
        EngineConfig {
            lock_poll_interval_ms: 1,
            run_poll_interval_secs: 0,
            user: "alice".into(),
            ..EngineConfig::default()
        }
    }

    pub fn new() -> Self {
        Self::build(Self::config(), SimulatedResource::localhost(), true)
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(config, SimulatedResource::localhost(), true)
    }

    pub fn with_resource(resource: SimulatedResource) -> Self {
        Self::build(Self::config(), resource, true)
    }

    pub fn without_kinds() -> Self {
        Self::build(Self::config(), SimulatedResource::localhost(), false)
    }

    fn build(config: EngineConfig, resource: SimulatedResource, kinds: bool) -> Self {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let clock = Arc::new(FixedClock::new(t0));
        let lrms = Arc::new(
            SimulatedLrms::new(resource, config.user.clone())
                .with_clock(clock.clone() as Arc<dyn Clock>),
        );

        let mut builder = EngineBuilder::new()
            .store(Arc::new(InMemoryTaskStore::new()))
            .clock(clock.clone())
            .backend(lrms.clone() as Arc<dyn Lrms>)
            .config(config);
        if kinds {
            builder = builder
                .register(Steps)
                .unwrap()
                .register(Gather)
                .unwrap()
                .with_builtin_tasks()
                .unwrap();
        }
        Self {
            engine: Arc::new(builder.build().unwrap()),
            clock,
            lrms,
        }
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(Arc::clone(&self.engine))
    }

    pub async fn load(&self, id: TaskId) -> TaskRecord {
        self.engine.store().load(id).await.unwrap()
    }
}
