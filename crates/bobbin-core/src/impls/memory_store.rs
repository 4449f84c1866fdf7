//! In-memory TaskStore implementation (tests and single-process demos).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::store_state::StoreState;
use crate::domain::{HolderId, StoreError, TaskId, TaskRecord, TaskType};
use crate::ports::TaskStore;

/// Every operation runs under one mutex, so each one is atomic with
/// respect to the others.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::new())),
        }
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.state.lock().await.insert(record)
    }

    async fn load(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.state.lock().await.load(id)
    }

    async fn save(&self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        self.state.lock().await.save(record)
    }

    async fn try_acquire(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.state.lock().await.try_acquire(id, holder, now, ttl)
    }

    async fn renew(
        &self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.state.lock().await.renew(id, holder, now, ttl)
    }

    async fn release(&self, id: TaskId, holder: HolderId) -> Result<TaskRecord, StoreError> {
        self.state.lock().await.release(id, holder)
    }

    async fn implicit_release(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        Ok(self.state.lock().await.implicit_release(now))
    }

    async fn find_eligible(&self, task_type: &TaskType) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.find_eligible(task_type))
    }

    async fn list(&self) -> Result<Vec<TaskRecord>, StoreError> {
        Ok(self.state.lock().await.list())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{StateName, Transition};
    use ulid::Ulid;

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskType::new("test.kind.v1"),
            StateName::new("READY"),
            serde_json::json!({ "n": 1 }),
            Vec::new(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let store = InMemoryTaskStore::new();
        let id = TaskId::from_ulid(Ulid::new());
        assert_eq!(store.load(id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn concurrent_acquirers_get_exactly_one_lease() {
        let store = InMemoryTaskStore::new();
        let r = record();
        store.insert(r.clone()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire(r.id, HolderId::from_ulid(Ulid::new()), Utc::now(), Duration::seconds(60))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let store = InMemoryTaskStore::new();
        let other = store.clone();
        let r = record();
        store.insert(r.clone()).await.unwrap();

        let mut loaded = other.load(r.id).await.unwrap();
        loaded.transition = Transition::Hold;
        other.save(&loaded).await.unwrap();

        assert_eq!(store.load(r.id).await.unwrap().transition, Transition::Hold);
    }
}
