//! Lrms port - Local Resource Management System の抽象化
//!
//! バッチキュー、SSH 経由のクラスタ、グリッドミドルウェアなど、
//! 実行環境ごとにこの trait を実装する。
//!
//! # 実装
//! - **SimulatedLrms**: プロセス内のシミュレーション（デモ・テスト用）
//! - **BatchLrms**: SGE 系バッチキューの汎用ヘルパー（コマンド実行は `CommandExecutor` に委譲）

use async_trait::async_trait;

use crate::domain::{
    Application, Artifact, JobHandle, JobStatus, LrmsError, ResourceDescriptor, ResourceStatus,
};

#[async_trait]
pub trait Lrms: Send + Sync {
    /// 静的な容量記述。必須フィールドの検証は Broker 側で行う
    fn descriptor(&self) -> ResourceDescriptor;

    fn name(&self) -> String {
        self.descriptor().name
    }

    async fn submit(&self, app: &Application) -> Result<JobHandle, LrmsError>;

    async fn check_status(&self, job: &JobHandle) -> Result<JobStatus, LrmsError>;

    async fn get_results(&self, job: &JobHandle) -> Result<Vec<Artifact>, LrmsError>;

    async fn cancel(&self, job: &JobHandle) -> Result<(), LrmsError>;

    /// 現在の占有状況。`user` の queued/running も数える
    async fn get_resource_status(&self, user: &str) -> Result<ResourceStatus, LrmsError>;
}
