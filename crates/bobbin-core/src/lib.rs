//! bobbin-core
//!
//! Lease-driven task execution engine: persistent per-task state machines,
//! a periodic scheduler that advances every pending task, and a resource
//! broker that places backend jobs.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task type / state, transition, lease, record, resource, job, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, Lrms, Clock, IdGenerator）
//! - **impls**: 実装（InMemoryTaskStore, FileTaskStore, SimulatedLrms, BatchLrms）
//! - **typed**: 型付き状態機械 API（TaskKind, StepContext, MachineRegistry）
//! - **app**: アプリケーションロジック（builder, engine, control, scheduler, broker, status）
//! - **tasks**: 組み込み task kind（SingleJob, FanOut, TaskTree）
//! - **config**: EngineConfig

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
pub mod tasks;
pub mod typed;

#[cfg(test)]
pub(crate) mod testing;

pub use app::{Control, Engine, EngineBuilder, Scheduler, StepOutcome};
pub use config::EngineConfig;
