//! Ports - 抽象化レイヤー
//!
//! Hexagonal Architecture の「ポート」。
//! 永続ストア・実行バックエンド・時刻・ID 生成を trait で抽象化し、
//! app 層はこれらの trait object だけに依存する。

pub mod clock;
pub mod id_generator;
pub mod lrms;
pub mod task_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lrms::Lrms;
pub use self::task_store::TaskStore;
