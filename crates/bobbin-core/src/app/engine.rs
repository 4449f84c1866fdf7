//! Engine - 1 task を 1 step 進める状態機械ドライバ
//!
//! # step の流れ
//! 1. lease を取る（`step_lock_timeout` まで）。取れなければ contention として何もせず戻る
//! 2. transition = RUNNING を保存
//! 3. state に対応する handler を別 tokio task で実行（panic もここで捕まえる）。
//!    実行中は heartbeat が lease を延ばす
//! 4. `Ok(true)` → COMPLETE、`Ok(false)` → PAUSED、`Err` / panic → ERROR
//! 5. `last_exec_at` を更新して保存
//! 6. どの経路でも lease を解放する
//!
//! handler のエラーは step の外に出さない。`Err` が返るのはストア自体の失敗だけ。

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::broker::Broker;
use super::control::Control;
use super::locking::{Heartbeat, Locker};
use crate::config::EngineConfig;
use crate::domain::{
    EngineError, HolderId, StepError, StoreError, TaskId, TaskRecord, TaskType, Transition,
};
use crate::ports::{Clock, IdGenerator, TaskStore};
use crate::typed::{MachineRegistry, StepEnv, StepResult, TaskKind};

/// What a single `step()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Another holder has the lease; the task was not touched.
    Contended,
    /// Acquired, but the task was not PAUSED; released unchanged.
    Skipped(Transition),
    /// A handler ran; the transition it ended in.
    Stepped(Transition),
}

pub struct Engine {
    store: Arc<dyn TaskStore>,
    registry: Arc<MachineRegistry>,
    broker: Arc<Broker>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    locker: Locker,
    config: EngineConfig,
}

impl Engine {
    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        registry: MachineRegistry,
        broker: Broker,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: EngineConfig,
    ) -> Self {
        let locker = Locker::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            ids.generate_holder_id(),
            &config,
        );
        Self {
            store,
            registry: Arc::new(registry),
            broker: Arc::new(broker),
            clock,
            ids,
            locker,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &MachineRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn holder(&self) -> HolderId {
        self.locker.holder()
    }

    /// Control surface with its own lease holder id.
    pub fn control(&self) -> Control {
        Control::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.ids.generate_holder_id(),
            self.config.clone(),
        )
    }

    fn env(&self) -> StepEnv {
        StepEnv {
            store: Arc::clone(&self.store),
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            registry: Arc::clone(&self.registry),
        }
    }

    /// Persist a new task of kind `K` in its initial state, PAUSED.
    ///
    /// `children` must already exist; their order is kept.
    pub async fn create<K: TaskKind>(
        &self,
        payload: K::Payload,
        children: Vec<TaskId>,
    ) -> Result<TaskId, EngineError> {
        if self.registry.get(K::TYPE).is_none() {
            return Err(EngineError::UnregisteredType(TaskType::new(K::TYPE)));
        }
        let state = K::initial_state()
            .name()
            .map_err(|e| EngineError::Payload(e.to_string()))?;
        let payload = serde_json::to_value(payload)
            .map_err(|e| EngineError::Payload(format!("{}: {e}", K::TYPE)))?;

        let id = self.ids.generate_task_id();
        let record = TaskRecord::new(
            id,
            TaskType::new(K::TYPE),
            state,
            payload,
            children,
            self.clock.now(),
        );
        self.store.insert(record).await?;
        info!(task_id = %id, task_type = K::TYPE, "task created");
        Ok(id)
    }

    /// Advance `id` by one state transition.
    pub async fn step(&self, id: TaskId) -> Result<StepOutcome, StoreError> {
        let record = match self.locker.acquire(id, self.config.step_lock_timeout()).await {
            Ok(record) => record,
            Err(StoreError::LockTimeout { .. }) => {
                debug!(task_id = %id, "task is locked by another holder, skipping");
                return Ok(StepOutcome::Contended);
            }
            Err(err) => return Err(err),
        };

        let result = if record.transition.is_schedulable() {
            self.advance(record).await.map(StepOutcome::Stepped)
        } else {
            debug!(task_id = %id, transition = %record.transition, "task is not PAUSED, leaving it alone");
            Ok(StepOutcome::Skipped(record.transition))
        };

        match self.locker.release(id).await {
            Ok(_) => result,
            Err(err) => {
                error!(task_id = %id, error = %err, "failed to release lease");
                result.and(Err(err))
            }
        }
    }

    async fn advance(&self, mut record: TaskRecord) -> Result<Transition, StoreError> {
        record.transition = Transition::Running;
        let mut record = self.store.save(&record).await?;

        let heartbeat = Heartbeat::start(self.locker.clone(), record.id);
        let outcome = self.invoke(&record).await;
        if let Some(renewed) = heartbeat.stop().await {
            record.revision = renewed.revision;
            record.lease = renewed.lease;
        }
        record.last_exec_at = Some(self.clock.now());
        match outcome {
            Ok(StepResult {
                state,
                payload,
                finished,
            }) => {
                record.state = state;
                record.payload = payload;
                record.last_error = None;
                record.transition = if finished {
                    self.settle(&record).await
                } else {
                    Transition::Paused
                };
            }
            Err(err) => {
                error!(
                    severity = "critical",
                    task_id = %record.id,
                    task_type = %record.task_type,
                    state = %record.state,
                    error = %err,
                    "step failed, task moved to ERROR"
                );
                record.transition = Transition::Error;
                record.last_error = Some(err.to_string());
            }
        }

        let saved = self.store.save(&record).await?;
        debug!(
            task_id = %saved.id,
            state = %saved.state,
            transition = %saved.transition,
            "step finished"
        );
        Ok(saved.transition)
    }

    /// Run the handler on its own tokio task so a panic ends up as ERROR.
    async fn invoke(&self, record: &TaskRecord) -> Result<StepResult, StepError> {
        let machine = self
            .registry
            .require(&record.task_type)
            .map_err(|_| StepError::UnregisteredType(record.task_type.clone()))?;
        let env = self.env();
        let snapshot = record.clone();
        let handle = tokio::spawn(async move { machine.step_dyn(&snapshot, env).await });
        match handle.await {
            Ok(result) => result,
            Err(join) => Err(StepError::Panicked(panic_message(join))),
        }
    }

    /// COMPLETE, unless some child is still unresolved.
    async fn settle(&self, record: &TaskRecord) -> Transition {
        match self.unresolved_children(record).await {
            Ok(0) => Transition::Complete,
            Ok(pending) => {
                debug!(task_id = %record.id, pending, "finished with unresolved children, staying PAUSED");
                Transition::Paused
            }
            Err(err) => {
                warn!(task_id = %record.id, error = %err, "cannot check children, staying PAUSED");
                Transition::Paused
            }
        }
    }

    async fn unresolved_children(&self, record: &TaskRecord) -> Result<usize, StoreError> {
        let mut pending = 0;
        for child in &record.children {
            match self.store.load(*child).await {
                Ok(child) if !child.done() => pending += 1,
                Ok(_) | Err(StoreError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(pending)
    }

    /// Foreground loop: step the task's pending descendants (children
    /// first) and then the task, sleeping `run_poll_interval` between
    /// rounds, until the task leaves PAUSED.
    pub async fn run(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        loop {
            let record = self.store.load(id).await?;
            if !in_progress(&record) {
                return Ok(record);
            }
            for descendant in self.pending_descendants(&record).await? {
                if let Err(err) = self.step(descendant).await {
                    warn!(task_id = %descendant, error = %err, "descendant step failed");
                }
            }
            self.step(id).await?;

            let record = self.store.load(id).await?;
            if !in_progress(&record) {
                return Ok(record);
            }
            tokio::time::sleep(self.config.run_poll_interval()).await;
        }
    }

    /// PAUSED descendants in post-order. Subtrees under a terminal task
    /// are not visited.
    async fn pending_descendants(&self, root: &TaskRecord) -> Result<Vec<TaskId>, StoreError> {
        let mut order = Vec::new();
        let mut seen = HashSet::from([root.id]);
        let mut stack: Vec<(TaskId, bool)> =
            root.children.iter().rev().map(|c| (*c, false)).collect();

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            if !seen.insert(id) {
                continue;
            }
            let record = match self.store.load(id).await {
                Ok(record) => record,
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            };
            if record.transition.is_terminal() {
                continue;
            }
            if record.transition.is_schedulable() {
                stack.push((id, true));
            }
            stack.extend(record.children.iter().rev().map(|c| (*c, false)));
        }
        Ok(order)
    }
}

fn in_progress(record: &TaskRecord) -> bool {
    matches!(record.transition, Transition::Paused | Transition::Running)
}

fn panic_message(join: tokio::task::JoinError) -> String {
    if join.is_cancelled() {
        return "handler task was cancelled".to_string();
    }
    let payload = join.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
