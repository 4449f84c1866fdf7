//! StoreState - TaskStore の同期ロジック本体
//!
//! InMemoryTaskStore（Mutex で包む）と FileTaskStore（ファイルから読み出して毎回操作する）の
//! 両方がこの構造体を共有する。ここには await がないので、ロックを跨いで await することはない。

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    HolderId, Lease, StoreError, TaskId, TaskRecord, TaskType, Transition,
};

#[derive(Debug, Default)]
pub(crate) struct StoreState {
    records: BTreeMap<TaskId, TaskRecord>,
}

/// On-disk layout of the file store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

impl StoreState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            records: snapshot.tasks.into_iter().map(|r| (r.id, r)).collect(),
        }
    }

    pub(crate) fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            tasks: self.records.values().cloned().collect(),
        }
    }

    fn get_mut(&mut self, id: TaskId) -> Result<&mut TaskRecord, StoreError> {
        self.records.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    pub(crate) fn insert(&mut self, mut record: TaskRecord) -> Result<(), StoreError> {
        if self.records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        record.revision = 0;
        self.records.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn load(&self, id: TaskId) -> Result<TaskRecord, StoreError> {
        self.records.get(&id).cloned().ok_or(StoreError::NotFound(id))
    }

    pub(crate) fn save(&mut self, record: &TaskRecord) -> Result<TaskRecord, StoreError> {
        let stored = self.get_mut(record.id)?;
        if stored.revision != record.revision {
            return Err(StoreError::Conflict {
                id: record.id,
                expected: record.revision,
                found: stored.revision,
            });
        }
        let mut next = record.clone();
        next.revision += 1;
        *stored = next.clone();
        Ok(next)
    }

    pub(crate) fn try_acquire(
        &mut self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let stored = self.get_mut(id)?;
        if let Some(lease) = &stored.lease
            && !lease.is_expired(now)
        {
            return Ok(None);
        }
        stored.lease = Some(Lease::new(holder, now, ttl));
        stored.revision += 1;
        Ok(Some(stored.clone()))
    }

    pub(crate) fn renew(
        &mut self,
        id: TaskId,
        holder: HolderId,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let stored = self.get_mut(id)?;
        match &mut stored.lease {
            Some(lease) if lease.is_held_by(holder) && !lease.is_expired(now) => {
                lease.expires_at = now + ttl;
            }
            _ => return Ok(None),
        }
        stored.revision += 1;
        Ok(Some(stored.clone()))
    }

    pub(crate) fn release(&mut self, id: TaskId, holder: HolderId) -> Result<TaskRecord, StoreError> {
        let stored = self.get_mut(id)?;
        if stored.lease.as_ref().is_some_and(|l| l.is_held_by(holder)) {
            stored.lease = None;
            stored.revision += 1;
        }
        Ok(stored.clone())
    }

    pub(crate) fn implicit_release(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut released = Vec::new();
        for record in self.records.values_mut() {
            let expired = record.lease.as_ref().is_some_and(|l| l.is_expired(now));
            let orphaned = record.transition == Transition::Running
                && (expired || record.lease.is_none());
            if expired {
                record.lease = None;
            }
            if orphaned {
                record.transition = Transition::Paused;
            }
            if expired || orphaned {
                record.revision += 1;
                released.push(record.id);
            }
        }
        released
    }

    pub(crate) fn find_eligible(&self, task_type: &TaskType) -> Vec<TaskRecord> {
        self.records
            .values()
            .rev()
            .filter(|r| &r.task_type == task_type && r.is_eligible())
            .cloned()
            .collect()
    }

    pub(crate) fn list(&self) -> Vec<TaskRecord> {
        self.records.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StateName;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn holder() -> HolderId {
        HolderId::from_ulid(Ulid::new())
    }

    fn record_at(ms: u64, transition: Transition) -> TaskRecord {
        let mut r = TaskRecord::new(
            TaskId::from_ulid(Ulid::from_parts(ms, 0)),
            TaskType::new("test.kind.v1"),
            StateName::new("READY"),
            serde_json::Value::Null,
            Vec::new(),
            t0(),
        );
        r.transition = transition;
        r
    }

    #[test]
    fn save_rejects_stale_revision() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Paused);
        state.insert(r.clone()).unwrap();

        let first = state.save(&r).unwrap();
        assert_eq!(first.revision, 1);

        // 古い revision のまま保存しようとすると Conflict
        let err = state.save(&r).unwrap_err();
        assert_eq!(
            err,
            StoreError::Conflict {
                id: r.id,
                expected: 0,
                found: 1
            }
        );
    }

    #[test]
    fn insert_twice_is_rejected() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Paused);
        state.insert(r.clone()).unwrap();
        assert_eq!(state.insert(r.clone()), Err(StoreError::AlreadyExists(r.id)));
    }

    #[test]
    fn acquire_is_exclusive_until_release() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Paused);
        state.insert(r.clone()).unwrap();
        let (a, b) = (holder(), holder());
        let ttl = Duration::seconds(60);

        let held = state.try_acquire(r.id, a, t0(), ttl).unwrap().unwrap();
        assert!(held.lease.as_ref().unwrap().is_held_by(a));
        assert!(state.try_acquire(r.id, b, t0(), ttl).unwrap().is_none());
        // 同じ holder でも再入はしない
        assert!(state.try_acquire(r.id, a, t0(), ttl).unwrap().is_none());

        // 他人の release は無視される
        state.release(r.id, b).unwrap();
        assert!(state.load(r.id).unwrap().is_locked());

        let released = state.release(r.id, a).unwrap();
        assert!(!released.is_locked());
        assert!(state.try_acquire(r.id, b, t0(), ttl).unwrap().is_some());
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Paused);
        state.insert(r.clone()).unwrap();
        let ttl = Duration::seconds(60);

        state.try_acquire(r.id, holder(), t0(), ttl).unwrap().unwrap();
        let later = t0() + Duration::seconds(61);
        assert!(state.try_acquire(r.id, holder(), later, ttl).unwrap().is_some());
    }

    #[test]
    fn renew_extends_only_a_live_lease_of_the_holder() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Paused);
        state.insert(r.clone()).unwrap();
        let (a, b) = (holder(), holder());
        let ttl = Duration::seconds(60);
        state.try_acquire(r.id, a, t0(), ttl).unwrap().unwrap();

        assert!(state.renew(r.id, b, t0(), ttl).unwrap().is_none());

        let renewed = state
            .renew(r.id, a, t0() + Duration::seconds(50), ttl)
            .unwrap()
            .unwrap();
        assert_eq!(renewed.revision, 2);
        assert_eq!(
            renewed.lease.as_ref().unwrap().expires_at,
            t0() + Duration::seconds(110)
        );

        // 期限切れの lease は延ばせない
        let late = t0() + Duration::seconds(111);
        assert!(state.renew(r.id, a, late, ttl).unwrap().is_none());
        state.release(r.id, a).unwrap();
        assert!(state.renew(r.id, a, t0(), ttl).unwrap().is_none());
    }

    #[test]
    fn implicit_release_clears_expired_leases_without_release() {
        let mut state = StoreState::new();
        let crashed = record_at(1, Transition::Paused);
        let alive = record_at(2, Transition::Paused);
        state.insert(crashed.clone()).unwrap();
        state.insert(alive.clone()).unwrap();

        state
            .try_acquire(crashed.id, holder(), t0(), Duration::seconds(10))
            .unwrap();
        // holder は RUNNING に設定したところでクラッシュした
        let mut running = state.load(crashed.id).unwrap();
        running.transition = Transition::Running;
        state.save(&running).unwrap();
        state
            .try_acquire(alive.id, holder(), t0(), Duration::seconds(600))
            .unwrap();

        let released = state.implicit_release(t0() + Duration::seconds(11));
        assert_eq!(released, vec![crashed.id]);

        let recovered = state.load(crashed.id).unwrap();
        assert!(recovered.lease.is_none());
        assert_eq!(recovered.transition, Transition::Paused);
        assert!(state.load(alive.id).unwrap().is_locked());
    }

    #[test]
    fn implicit_release_reverts_running_without_lease() {
        let mut state = StoreState::new();
        let r = record_at(1, Transition::Running);
        state.insert(r.clone()).unwrap();

        assert_eq!(state.implicit_release(t0()), vec![r.id]);
        assert_eq!(state.load(r.id).unwrap().transition, Transition::Paused);
        assert!(state.implicit_release(t0()).is_empty());
    }

    #[rstest]
    #[case::running(Transition::Running, false)]
    #[case::paused(Transition::Paused, true)]
    #[case::error(Transition::Error, false)]
    #[case::complete(Transition::Complete, false)]
    #[case::hold(Transition::Hold, false)]
    fn eligibility_by_transition(#[case] transition: Transition, #[case] eligible: bool) {
        let mut state = StoreState::new();
        let r = record_at(1, transition);
        state.insert(r.clone()).unwrap();

        let found = state.find_eligible(&r.task_type);
        assert_eq!(!found.is_empty(), eligible);
    }

    #[test]
    fn eligible_set_is_paused_unlocked_of_type_newest_first() {
        let mut state = StoreState::new();
        let transitions = [
            Transition::Running,
            Transition::Paused,
            Transition::Error,
            Transition::Complete,
            Transition::Hold,
            Transition::Paused,
        ];
        for (i, t) in transitions.into_iter().enumerate() {
            state.insert(record_at(i as u64 + 1, t)).unwrap();
        }
        let locked = record_at(10, Transition::Paused);
        state.insert(locked.clone()).unwrap();
        state
            .try_acquire(locked.id, holder(), t0(), Duration::seconds(60))
            .unwrap();
        let mut other_type = record_at(11, Transition::Paused);
        other_type.task_type = TaskType::new("other.kind.v1");
        state.insert(other_type).unwrap();

        let found: Vec<u64> = state
            .find_eligible(&TaskType::new("test.kind.v1"))
            .iter()
            .map(|r| r.id.as_ulid().timestamp_ms())
            .collect();
        assert_eq!(found, vec![6, 2]);
    }
}
