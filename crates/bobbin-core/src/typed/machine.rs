//! DynMachine - object-safe な状態機械
//!
//! # 学習ポイント
//! - Object-safe trait (DynMachine)
//! - Type erasure パターン (TypedMachine<K> → DynMachine)
//!
//! engine はストア上の record（state は文字列、payload は JSON）しか知らない。
//! TypedMachine<K> がそれを K の state enum / payload 型に戻してから handler を呼ぶ。

use async_trait::async_trait;

use super::context::{StepContext, StepEnv};
use super::kind::{Phase, TaskKind};
use crate::domain::{StateName, StepError, TaskRecord, TaskType};

/// What one successful handler invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub state: StateName,
    pub payload: serde_json::Value,
    /// The handler reported a terminal condition.
    pub finished: bool,
}

#[async_trait]
pub trait DynMachine: Send + Sync {
    fn task_type(&self) -> &'static str;

    fn success_state(&self) -> StateName;

    async fn step_dyn(&self, record: &TaskRecord, env: StepEnv) -> Result<StepResult, StepError>;
}

pub struct TypedMachine<K> {
    kind: K,
}

impl<K: TaskKind> TypedMachine<K> {
    pub fn new(kind: K) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl<K: TaskKind> DynMachine for TypedMachine<K> {
    fn task_type(&self) -> &'static str {
        K::TYPE
    }

    fn success_state(&self) -> StateName {
        K::success_state()
    }

    async fn step_dyn(&self, record: &TaskRecord, env: StepEnv) -> Result<StepResult, StepError> {
        let phase = Phase::<K::State>::from_name(&record.state).ok_or_else(|| {
            StepError::UnhandledState {
                task_type: TaskType::new(K::TYPE),
                state: record.state.clone(),
            }
        })?;
        let payload: K::Payload = serde_json::from_value(record.payload.clone())
            .map_err(|e| StepError::Payload(format!("{}: {e}", K::TYPE)))?;

        let mut ctx = StepContext::<K>::new(record, payload, env);
        let finished = match phase {
            Phase::State(state) => self.kind.handle(state, &mut ctx).await?,
            Phase::Kill => self.kind.kill(&mut ctx).await?,
            Phase::Complete => true,
        };

        let (next, payload) = ctx.into_parts();
        let state = match next {
            Some(phase) => phase.name()?,
            None => record.state.clone(),
        };
        let payload = serde_json::to_value(payload)
            .map_err(|e| StepError::Payload(format!("{}: {e}", K::TYPE)))?;

        Ok(StepResult {
            state,
            payload,
            finished,
        })
    }
}
