//! App - アプリケーション層
//!
//! ports だけに依存して engine / control / scheduler / broker を組み立てる。

pub mod broker;
pub mod builder;
pub mod control;
pub mod engine;
pub mod locking;
pub mod scheduler;
pub mod status;

pub use self::broker::{Broker, Candidate, compare_status};
pub use self::builder::{BuildError, EngineBuilder};
pub use self::control::{Control, ControlReport, TaskReport};
pub use self::engine::{Engine, StepOutcome};
pub use self::locking::Locker;
pub use self::scheduler::{PassSummary, Scheduler};
pub use self::status::{StatusSummary, TransitionCounts};
