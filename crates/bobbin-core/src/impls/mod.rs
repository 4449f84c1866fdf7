//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: テスト・単一プロセス用の正本
//! - **FileTaskStore**: JSON ファイルの正本（プロセス間で共有可能）
//! - **SimulatedLrms**: シミュレーションのバックエンド
//! - **BatchLrms**: Grid Engine 系バッチキューの汎用ヘルパー

mod store_state;

pub mod batch;
pub mod file_store;
pub mod memory_store;
pub mod sim_lrms;

pub use self::batch::{BatchConfig, BatchLrms, CommandExecutor, CommandOutput, LocalExecutor};
pub use self::file_store::FileTaskStore;
pub use self::memory_store::InMemoryTaskStore;
pub use self::sim_lrms::{SimulatedLrms, SimulatedResource};
