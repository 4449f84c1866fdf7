//! Errors - エラー型と分類
//!
//! # 方針
//! - エラーはただの値。生成時にはログを出さない（ログは catch 側で出す）
//! - 層ごとに enum を分ける: store / backend / step / control
//!
//! # 分類
//! - Contention: `StoreError::LockTimeout`。scheduler にとっては「今回はスキップ」
//! - Per-task fatal: `StepError::UnhandledState` など。task は ERROR になり operator の retry 待ち
//! - Backend transient: `LrmsError::Transient`。handler 内で吸収して次のパスで再試行

use chrono::Duration;

use super::{JobStatus, StateName, TaskId, TaskType};

/// Storage contract failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("revision conflict on {id}: expected {expected}, found {found}")]
    Conflict { id: TaskId, expected: u64, found: u64 },

    #[error("lock on {id} not acquired within {}s", .waited.num_seconds())]
    LockTimeout { id: TaskId, waited: Duration },

    #[error("task {0} already exists")]
    AlreadyExists(TaskId),

    #[error("store i/o: {0}")]
    Io(String),

    #[error("store data is corrupt: {0}")]
    Corrupt(String),
}

/// Backend (LRMS) failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LrmsError {
    /// Worth retrying on the next pass (network blip, backend busy).
    #[error("transient backend error: {0}")]
    Transient(String),

    #[error("backend authentication failed: {0}")]
    Authentication(String),

    #[error("backend rejected the job: {0}")]
    Rejected(String),

    #[error("backend does not know job {0}")]
    UnknownJob(String),

    #[error("backend error: {0}")]
    Failed(String),
}

impl LrmsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LrmsError::Transient(_))
    }
}

/// A handler or step failure. Every variant ends in an ERROR transition.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("task type '{task_type}' has no handler for state '{state}'")]
    UnhandledState { task_type: TaskType, state: StateName },

    #[error("task type '{0}' is not registered")]
    UnregisteredType(TaskType),

    #[error("child task {child} of {parent} finished unsuccessfully")]
    ChildNode { parent: TaskId, child: TaskId },

    #[error("job {job} ended as {status}")]
    JobFailed { job: String, status: JobStatus },

    #[error("payload: {0}")]
    Payload(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("no resource accepted application '{0}'")]
    NoResources(String),

    #[error(transparent)]
    Lrms(#[from] LrmsError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid resource descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("resource '{resource}' is missing required field '{field}'")]
    MissingField {
        resource: String,
        field: &'static str,
    },
}

/// Failures of the interactive control surface.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("task {0} does not exist")]
    NotFound(TaskId),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ControlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ControlError::NotFound(id),
            other => ControlError::Store(other),
        }
    }
}

/// Failures creating or driving tasks outside the scheduler.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("payload: {0}")]
    Payload(String),

    #[error("task type '{0}' is not registered")]
    UnregisteredType(TaskType),

    #[error(transparent)]
    Store(#[from] StoreError),
}
