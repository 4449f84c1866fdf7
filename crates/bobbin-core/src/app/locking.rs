//! Locker - lease の取得（タイムアウト付き）と解放
//!
//! `TaskStore::try_acquire` は 1 回だけの CAS。ここではそれを
//! `lock_poll_interval` ごとに `timeout` まで繰り返す。
//! timeout 0 は「1 回だけ試す」。
//!
//! handler の実行中は `Heartbeat` が TTL の 1/3 ごとに lease を延ばす。

use std::sync::Arc;

use chrono::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::config::EngineConfig;
use crate::domain::{HolderId, StoreError, TaskId, TaskRecord};
use crate::ports::{Clock, TaskStore};

#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    holder: HolderId,
    ttl: Duration,
    poll: std::time::Duration,
}

impl Locker {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        holder: HolderId,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            clock,
            holder,
            ttl: config.lease_ttl(),
            poll: config.lock_poll_interval(),
        }
    }

    pub fn holder(&self) -> HolderId {
        self.holder
    }

    /// Acquire the lease on `id`, or `LockTimeout` after `timeout`.
    pub async fn acquire(&self, id: TaskId, timeout: Duration) -> Result<TaskRecord, StoreError> {
        let wait = timeout.to_std().unwrap_or_default();
        let deadline = Instant::now() + wait;
        loop {
            let now = self.clock.now();
            if let Some(record) = self.store.try_acquire(id, self.holder, now, self.ttl).await? {
                trace!(task_id = %id, holder = %self.holder, "lease acquired");
                return Ok(record);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StoreError::LockTimeout { id, waited: timeout });
            }
            tokio::time::sleep(self.poll.min(remaining)).await;
        }
    }

    /// `None` once the lease has expired or moved to another holder.
    pub async fn renew(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let now = self.clock.now();
        let renewed = self.store.renew(id, self.holder, now, self.ttl).await?;
        if renewed.is_some() {
            trace!(task_id = %id, holder = %self.holder, "lease renewed");
        }
        Ok(renewed)
    }

    pub async fn release(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        let record = self.store.release(id, self.holder).await?;
        trace!(task_id = %id, holder = %self.holder, "lease released");
        Ok(record)
    }
}

const MIN_HEARTBEAT: std::time::Duration = std::time::Duration::from_millis(100);

/// Background renewal of one held lease.
pub struct Heartbeat {
    stop: watch::Sender<bool>,
    task: JoinHandle<Option<TaskRecord>>,
}

impl Heartbeat {
    pub fn start(locker: Locker, id: TaskId) -> Self {
        let period = (locker.ttl.to_std().unwrap_or_default() / 3).max(MIN_HEARTBEAT);
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut latest = None;
            loop {
                tokio::select! {
                    _ = stopped.changed() => break,
                    _ = tokio::time::sleep(period) => {}
                }
                match locker.renew(id).await {
                    Ok(Some(record)) => latest = Some(record),
                    Ok(None) => {
                        warn!(task_id = %id, "lease lost while the handler was running");
                        break;
                    }
                    Err(err) => warn!(task_id = %id, error = %err, "lease renewal failed"),
                }
            }
            latest
        });
        Self { stop, task }
    }

    /// Stops renewing. Returns the record as of the last renewal, if there was one.
    pub async fn stop(self) -> Option<TaskRecord> {
        // ignore send error: the loop may have ended on its own
        let _ = self.stop.send(true);
        self.task.await.ok().flatten()
    }
}
