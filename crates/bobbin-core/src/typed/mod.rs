//! Typed - 型付き状態機械 API
//!
//! state の文字列キーによる dispatch を型で置き換え、
//! task_type と state 表の対応を静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `TaskKind` trait, `Phase<S>`, `StepContext<K>` - 型安全
//! - **内部（Dyn）**: `DynMachine` trait - object-safe, type erasure

pub mod context;
pub mod kind;
pub mod machine;
pub mod registry;

pub use self::context::{StepContext, StepEnv};
pub use self::kind::{MachineState, Phase, TaskKind};
pub use self::machine::{DynMachine, StepResult, TypedMachine};
pub use self::registry::{MachineRegistry, RegistryError};
