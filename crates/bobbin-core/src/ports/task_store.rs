//! TaskStore port - task record の正本（source of truth）
//!
//! scheduler と control コマンドは別プロセス・別ホストから同じストアを触る。
//! そのため排他は言語レベルの mutex ではなく、record 上の lease で行う。
//!
//! # 設計原則
//! - `save` は楽観的並行性制御: `revision` が進んでいれば `Conflict`
//! - `try_acquire` はストア側の compare-and-swap（lease が空か期限切れのときだけ成功）
//! - lease 操作も revision を進め、更新後の record を返す
//! - `implicit_release` はクラッシュした holder の lease を回収する唯一の復旧手段

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::domain::{HolderId, StoreError, TaskId, TaskRecord, TaskType};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 新規 record を保存する。`revision` は 0 から始まる
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    async fn load(&self, id: TaskId) -> Result<TaskRecord, StoreError>;

    /// `record.revision` が保存済みのものと一致するときだけ書き込み、
    /// revision を 1 進めた record を返す
    async fn save(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError>;

    /// lease が空か期限切れなら `holder` の lease を付けて `Some(record)`、
    /// 他者が有効な lease を持っていれば `None`（contention）
    async fn try_acquire(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// `holder` が持つ期限内の lease を `now + ttl` まで延ばす。
    /// lease を既に失っていれば `None`
    async fn renew(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// `holder` の lease を外す。lease が既に他者のものなら何もしない
    async fn release(&self, id: TaskId, holder: HolderId) -> Result<TaskRecord, StoreError>;

    /// 期限切れ lease をすべて外し、holder 不在の RUNNING を PAUSED に戻す。
    /// 回収した task id を返す
    async fn implicit_release(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError>;

    /// `task_type` の PAUSED かつ lease なしの record を id 降順で返す
    async fn find_eligible(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, StoreError>;

    /// 全 record を id 昇順で返す
    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError>;
}
