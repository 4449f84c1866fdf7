//! Tasks - 組み込みの task kind
//!
//! - **SingleJob**: application 1 つを backend job 1 つとして実行
//! - **FanOut**: 同じ application の SingleJob を N 個並べて待つ
//! - **TaskTree**: 同じ kind の子を再帰的に持つ木（負荷試験用）

pub mod fanout;
pub mod jobs;
pub mod single;
pub mod tree;

pub use self::fanout::{FanOut, FanOutPayload, FanOutState, FanOutSummary};
pub use self::jobs::Progress;
pub use self::single::{SingleJob, SingleJobPayload, SingleJobState};
pub use self::tree::{TaskTree, TaskTreePayload, TaskTreeState};
