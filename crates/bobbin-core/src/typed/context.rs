//! StepContext - handler が 1 step の間に触れるもの
//!
//! handler は payload を直接書き換え、`goto` で次の state を決める。
//! 結果は handler が `Ok` を返したときだけ保存される（`Err` なら state も payload も元のまま）。

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::kind::{Phase, TaskKind};
use super::registry::MachineRegistry;
use crate::app::Broker;
use crate::domain::{StepError, TaskId, TaskRecord};
use crate::ports::{Clock, TaskStore};

/// Shared collaborators handed to every step.
#[derive(Clone)]
pub struct StepEnv {
    pub store: Arc<dyn TaskStore>,
    pub broker: Arc<Broker>,
    pub clock: Arc<dyn Clock>,
    pub registry: Arc<MachineRegistry>,
}

pub struct StepContext<K: TaskKind> {
    id: TaskId,
    children: Vec<TaskId>,
    pub payload: K::Payload,
    next: Option<Phase<K::State>>,
    env: StepEnv,
}

impl<K: TaskKind> StepContext<K> {
    pub(crate) fn new(record: &TaskRecord, payload: K::Payload, env: StepEnv) -> Self {
        Self {
            id: record.id,
            children: record.children.clone(),
            payload,
            next: None,
            env,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn children(&self) -> &[TaskId] {
        &self.children
    }

    pub fn broker(&self) -> &Broker {
        &self.env.broker
    }

    pub fn store(&self) -> &dyn TaskStore {
        self.env.store.as_ref()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.env.clock.now()
    }

    /// Next state, persisted when the handler returns `Ok`.
    pub fn goto(&mut self, phase: Phase<K::State>) {
        self.next = Some(phase);
    }

    pub async fn child_records(&self) -> Result<Vec<TaskRecord>, StepError> {
        let mut records = Vec::with_capacity(self.children.len());
        for child in &self.children {
            records.push(self.env.store.load(*child).await?);
        }
        Ok(records)
    }

    /// `Ok(true)` once every child is done and successful.
    ///
    /// The first done-but-unsuccessful child fails the wait with
    /// `StepError::ChildNode`, whether or not the others are done.
    pub async fn wait_children(&self) -> Result<bool, StepError> {
        let mut successful = 0;
        for child in &self.children {
            let record = self.env.store.load(*child).await?;
            if !record.done() {
                continue;
            }
            let success_state = self.env.registry.success_state_of(&record.task_type);
            if !record.successful(&success_state) {
                return Err(StepError::ChildNode {
                    parent: self.id,
                    child: record.id,
                });
            }
            successful += 1;
        }
        Ok(successful == self.children.len())
    }

    pub(crate) fn into_parts(self) -> (Option<Phase<K::State>>, K::Payload) {
        (self.next, self.payload)
    }
}
