//! Scheduler - 全 task を 1 パス進める周期ドライバ
//!
//! # 1 パスの流れ
//! 1. `implicit_release` で期限切れ lease と取り残された RUNNING を回収
//! 2. 登録済み task_type ごとに PAUSED かつ lease なしの record を id 降順で取得
//! 3. 1 件ずつ `Engine::step`（`step_workers > 0` なら JoinSet + Semaphore で並列）
//!
//! 1 件の失敗で走査は止めない。パス全体を止めるのはストアに届かないときだけ。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::engine::{Engine, StepOutcome};
use crate::domain::{StoreError, TaskId};

/// Counts of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Leases reclaimed by `implicit_release`.
    pub released: usize,
    pub stepped: usize,
    pub contended: usize,
    pub skipped: usize,
    /// Steps that ended in a store failure or a crashed worker.
    pub failed: usize,
}

impl PassSummary {
    fn record(&mut self, id: TaskId, result: Result<StepOutcome, StoreError>) {
        match result {
            Ok(StepOutcome::Stepped(_)) => self.stepped += 1,
            Ok(StepOutcome::Contended) => self.contended += 1,
            Ok(StepOutcome::Skipped(_)) => self.skipped += 1,
            Err(err) => {
                error!(task_id = %id, error = %err, "step failed on the store");
                self.failed += 1;
            }
        }
    }
}

pub struct Scheduler {
    engine: Arc<Engine>,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub async fn handle_waiting_tasks(&self) -> Result<PassSummary, StoreError> {
        let mut summary = PassSummary::default();
        let store = self.engine.store();

        let released = store.implicit_release(self.engine.now()).await?;
        if !released.is_empty() {
            info!(count = released.len(), "reclaimed stale leases");
        }
        summary.released = released.len();

        let mut eligible = Vec::new();
        for task_type in self.engine.registry().task_types() {
            let records = store.find_eligible(&task_type).await?;
            debug!(task_type = %task_type, eligible = records.len(), "scanned task type");
            eligible.extend(records.into_iter().map(|r| r.id));
        }

        match self.engine.config().step_workers {
            0 => {
                for id in eligible {
                    let result = self.engine.step(id).await;
                    summary.record(id, result);
                }
            }
            workers => self.step_pooled(eligible, workers, &mut summary).await,
        }

        info!(
            released = summary.released,
            stepped = summary.stepped,
            contended = summary.contended,
            skipped = summary.skipped,
            failed = summary.failed,
            "scheduler pass finished"
        );
        Ok(summary)
    }

    async fn step_pooled(&self, ids: Vec<TaskId>, workers: usize, summary: &mut PassSummary) {
        let permits = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        for id in ids {
            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let engine = Arc::clone(&self.engine);
            set.spawn(async move {
                let _permit = permit;
                (id, engine.step(id).await)
            });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((id, result)) => summary.record(id, result),
                Err(err) => {
                    error!(severity = "critical", error = %err, "step worker crashed");
                    summary.failed += 1;
                }
            }
        }
    }

    /// One pass for an unattended driver: nothing escapes, failures are logged.
    pub async fn run(&self) -> Option<PassSummary> {
        match self.handle_waiting_tasks().await {
            Ok(summary) => Some(summary),
            Err(err) => {
                error!(severity = "critical", error = %err, "scheduler pass aborted");
                None
            }
        }
    }

    /// `run()` every `period` until `shutdown` turns true or its sender is
    /// dropped. Returns the number of passes.
    pub async fn run_every(&self, period: Duration, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut passes = 0;
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.run().await;
                    passes += 1;
                }
            }
        }
        passes
    }
}
