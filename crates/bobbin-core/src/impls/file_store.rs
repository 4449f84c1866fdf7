//! FileTaskStore - JSON ファイル 1 つを正本にする TaskStore
//!
//! scheduler（cron から起動）と control コマンドは別プロセスで同じファイルを使う。
//! 各操作は次の手順でプロセス間でも atomic になる:
//!
//! 1. `<path>.lock` を `create_new` で作り、固有の token を書く（既にあれば待つ。古すぎるものは壊して取り直す）
//! 2. JSON を読み込んで `StoreState` に展開
//! 3. 操作を適用
//! 4. 書き込み系なら一時ファイルに書いて rename
//! 5. token が自分のものならロックファイルを削除（Drop）

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, warn};
use ulid::Ulid;

use super::store_state::{StoreSnapshot, StoreState};
use crate::domain::{HolderId, StoreError, TaskId, TaskRecord, TaskType};
use crate::ports::TaskStore;

const LOCK_WAIT: StdDuration = StdDuration::from_secs(10);
const LOCK_RETRY: StdDuration = StdDuration::from_millis(10);
const LOCK_STALE_AFTER: StdDuration = StdDuration::from_secs(30);

pub struct FileTaskStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileTaskStore {
    /// ファイルは最初の書き込みで作られる。親ディレクトリはここで作る
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let lock_path = sibling(&path, "lock");
        Ok(Self { path, lock_path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<StoreState, StoreError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(StoreState::new()),
            Err(e) => return Err(io_error(e)),
        };
        if text.trim().is_empty() {
            return Ok(StoreState::new());
        }
        let snapshot: StoreSnapshot = serde_json::from_str(&text)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        Ok(StoreState::from_snapshot(snapshot))
    }

    async fn write(&self, state: &StoreState) -> Result<(), StoreError> {
        let text = serde_json::to_string_pretty(&state.snapshot())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let tmp = sibling(&self.path, "tmp");
        tokio::fs::write(&tmp, text).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error)?;
        Ok(())
    }

    async fn read_only<T>(
        &self,
        op: impl FnOnce(&StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = FileLock::acquire(&self.lock_path).await?;
        let state = self.read().await?;
        op(&state)
    }

    async fn mutate<T>(
        &self,
        op: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _lock = FileLock::acquire(&self.lock_path).await?;
        let mut state = self.read().await?;
        let out = op(&mut state)?;
        self.write(&state).await?;
        Ok(out)
    }
}

fn sibling(path: &Path, ext: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(ext);
    path.with_file_name(name)
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

/// プロセス間ロック。Drop でロックファイルを消す
struct FileLock {
    path: PathBuf,
    token: String,
}

impl FileLock {
    async fn acquire(path: &Path) -> Result<Self, StoreError> {
        let deadline = Instant::now() + LOCK_WAIT;
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(path)
                .await
            {
                Ok(mut file) => {
                    let lock = Self {
                        path: path.to_path_buf(),
                        token: Ulid::new().to_string(),
                    };
                    file.write_all(lock.token.as_bytes()).await.map_err(io_error)?;
                    file.flush().await.map_err(io_error)?;
                    return Ok(lock);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if let Some(token) = stale_token(path).await {
                        warn!(lock = %path.display(), "breaking stale store lock");
                        remove_if_owned(path, &token);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StoreError::Io(format!(
                            "store lock {} busy for {}s",
                            path.display(),
                            LOCK_WAIT.as_secs()
                        )));
                    }
                    debug!(lock = %path.display(), "store lock busy, waiting");
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(io_error(e)),
            }
        }
    }
}

/// Token of a lock file older than `LOCK_STALE_AFTER`.
async fn stale_token(path: &Path) -> Option<String> {
    let token = tokio::fs::read_to_string(path).await.ok()?;
    let meta = tokio::fs::metadata(path).await.ok()?;
    let age = SystemTime::now().duration_since(meta.modified().ok()?).ok()?;
    (age > LOCK_STALE_AFTER).then_some(token)
}

/// Removes the lock file only while it still carries `token`.
///
/// The file is first renamed aside, so a lock taken by someone else in the
/// meantime is never deleted; it is linked back instead.
fn remove_if_owned(path: &Path, token: &str) -> bool {
    let aside = sibling(path, &format!("{}.stale", Ulid::new()));
    if std::fs::rename(path, &aside).is_err() {
        return false;
    }
    let owned = std::fs::read_to_string(&aside).is_ok_and(|t| t == token);
    if !owned && std::fs::hard_link(&aside, path).is_err() {
        warn!(lock = %path.display(), "lock changed hands while being released");
    }
    let _ = std::fs::remove_file(&aside);
    owned
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // another process may have broken the lock and taken it
        if !remove_if_owned(&self.path, &self.token) {
            debug!(lock = %self.path.display(), "store lock no longer ours, left in place");
        }
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.mutate(|s| s.insert(record)).await
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.read_only(|s| s.load(id)).await
    }

    async fn save(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.mutate(|s| s.save(record)).await
    }

    async fn try_acquire(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.mutate(|s| s.try_acquire(id, holder, now, ttl)).await
    }

    async fn renew(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.mutate(|s| s.renew(id, holder, now, ttl)).await
    }

    async fn release(&self, id: TaskId, holder: HolderId) -> Result<TaskRecord, StoreError> {
        self.mutate(|s| s.release(id, holder)).await
    }

    async fn implicit_release(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        self.mutate(|s| Ok(s.implicit_release(now))).await
    }

    async fn find_eligible(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, StoreError> {
        self.read_only(|s| Ok(s.find_eligible(task_type))).await
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.read_only(|s| Ok(s.list())).await
    }
}
