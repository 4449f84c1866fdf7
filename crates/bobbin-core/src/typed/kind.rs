//! TaskKind trait - 型付きの状態機械定義
//!
//! # 学習ポイント
//! - Associated Constants (`const TYPE`) と Associated Types (`State`, `Payload`)
//! - state は文字列キーではなく enum。`match` の網羅性で state → handler の対応をチェック
//! - COMPLETE と KILL はすべての kind に共通の終端（`Phase`）

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::context::StepContext;
use crate::domain::{StateName, StepError};

/// Kind-specific state enum.
///
/// Use unit variants with `#[serde(rename_all = "SCREAMING_SNAKE_CASE")]`;
/// the serialized variant name is the stored state.
pub trait MachineState:
    Serialize + DeserializeOwned + Copy + Eq + fmt::Debug + Send + Sync + 'static
{
}

impl<T> MachineState for T where
    T: Serialize + DeserializeOwned + Copy + Eq + fmt::Debug + Send + Sync + 'static
{
}

/// A kind's own states plus the two universal terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase<S> {
    State(S),
    Complete,
    Kill,
}

impl<S: MachineState> Phase<S> {
    /// `None` when the stored name is not a state of this kind.
    pub fn from_name(name: &StateName) -> Option<Self> {
        match name.as_str() {
            StateName::COMPLETE => Some(Phase::Complete),
            StateName::KILL => Some(Phase::Kill),
            other => serde_json::from_value(serde_json::Value::String(other.to_string()))
                .ok()
                .map(Phase::State),
        }
    }

    pub fn name(&self) -> Result<StateName, StepError> {
        match self {
            Phase::Complete => Ok(StateName::complete()),
            Phase::Kill => Ok(StateName::kill()),
            Phase::State(s) => match serde_json::to_value(s) {
                Ok(serde_json::Value::String(name)) => Ok(StateName::new(name)),
                Ok(other) => Err(StepError::Payload(format!(
                    "state {s:?} does not serialize to a name: {other}"
                ))),
                Err(e) => Err(StepError::Payload(format!("state {s:?}: {e}"))),
            },
        }
    }
}

/// TaskKind は task_type と state 表・payload 型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
/// #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
/// enum EchoState { Ready }
///
/// struct Echo;
///
/// #[async_trait]
/// impl TaskKind for Echo {
///     const TYPE: &'static str = "acme.echo.v1";
///     type State = EchoState;
///     type Payload = String;
///
///     fn initial_state() -> Phase<EchoState> {
///         Phase::State(EchoState::Ready)
///     }
///
///     async fn handle(&self, state: EchoState, ctx: &mut StepContext<Self>) -> Result<bool, StepError> {
///         match state {
///             EchoState::Ready => {
///                 ctx.goto(Phase::Complete);
///                 Ok(true)
///             }
///         }
///     }
/// }
/// ```
///
/// # 戻り値
/// - `Ok(true)`: この task は終端に達した（transition = COMPLETE）
/// - `Ok(false)`: まだ続きがある（transition = PAUSED、次のパスで再び step）
/// - `Err(_)`: transition = ERROR。state は変わらず、operator の retry で同じ state から再開
#[async_trait]
pub trait TaskKind: Send + Sync + Sized + 'static {
    /// `{namespace}.{kind}.v{major}`
    const TYPE: &'static str;

    type State: MachineState;

    type Payload: Serialize + DeserializeOwned + Send + Sync + 'static;

    fn initial_state() -> Phase<Self::State>;

    /// State that counts as success for a parent waiting on this task.
    fn success_state() -> StateName {
        StateName::complete()
    }

    async fn handle(
        &self,
        state: Self::State,
        ctx: &mut StepContext<Self>,
    ) -> Result<bool, StepError>;

    /// KILL handler. The default just signals completion.
    async fn kill(&self, _ctx: &mut StepContext<Self>) -> Result<bool, StepError> {
        Ok(true)
    }
}
