//! Control - operator 向けの操作（kill / retry / info / hold / resume / show / status）
//!
//! scheduler とは別プロセスから呼ばれる前提。record の変更は必ず lease を取ってから行い、
//! どの経路でも解放する。scheduler は id 降順、こちらは id 昇順に辿る。
//!
//! kill / retry は子へ再帰する。トップレベルの失敗はそのまま返し、
//! 子の失敗はログに残して `ControlReport::failed` に積むだけにする。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use super::locking::Locker;
use super::status::StatusSummary;
use crate::config::EngineConfig;
use crate::domain::{ControlError, HolderId, StateName, TaskId, TaskRecord, Transition};
use crate::ports::{Clock, TaskStore};

/// Per-node outcome of a recursive kill or retry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControlReport {
    /// Nodes whose record was changed.
    pub changed: Vec<TaskId>,
    /// Nodes visited but left as they were.
    pub unchanged: Vec<TaskId>,
    /// Child nodes that could not be handled, with the reason.
    pub failed: Vec<(TaskId, String)>,
}

impl ControlReport {
    pub fn was_changed(&self, id: TaskId) -> bool {
        self.changed.contains(&id)
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Kill,
    Retry,
}

pub struct Control {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    locker: Locker,
    config: EngineConfig,
}

impl Control {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        holder: HolderId,
        config: EngineConfig,
    ) -> Self {
        let locker = Locker::new(Arc::clone(&store), Arc::clone(&clock), holder, &config);
        Self {
            store,
            clock,
            locker,
            config,
        }
    }

    /// Force `state = KILL, transition = PAUSED` on `id` and its descendants.
    ///
    /// A COMPLETE node is left as it is. The backend work stops the next
    /// time the scheduler runs the KILL handler.
    pub async fn kill(&self, id: TaskId) -> Result<ControlReport, ControlError> {
        let report = self.apply(Op::Kill, id).await?;
        info!(task_id = %id, killed = report.changed.len(), failed = report.failed.len(), "kill requested");
        Ok(report)
    }

    /// Put ERROR nodes back to PAUSED, keeping their state.
    ///
    /// Nodes in any other transition are left alone; children are visited
    /// either way.
    pub async fn retry(&self, id: TaskId) -> Result<ControlReport, ControlError> {
        let report = self.apply(Op::Retry, id).await?;
        info!(task_id = %id, retried = report.changed.len(), failed = report.failed.len(), "retry requested");
        Ok(report)
    }

    async fn apply(&self, op: Op, id: TaskId) -> Result<ControlReport, ControlError> {
        let mut report = ControlReport::default();
        let (record, changed) = self.apply_node(op, id).await?;
        report.record(id, changed);
        self.apply_children(op, record.children, &mut report).await;
        Ok(report)
    }

    fn apply_children<'a>(
        &'a self,
        op: Op,
        children: Vec<TaskId>,
        report: &'a mut ControlReport,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            for child in children {
                let grandchildren = match self.apply_node(op, child).await {
                    Ok((record, changed)) => {
                        report.record(child, changed);
                        record.children
                    }
                    Err(err) => {
                        warn!(task_id = %child, op = ?op, error = %err, "child could not be handled, continuing");
                        report.failed.push((child, err.to_string()));
                        match self.store.load(child).await {
                            Ok(record) => record.children,
                            Err(_) => Vec::new(),
                        }
                    }
                };
                self.apply_children(op, grandchildren, report).await;
            }
        })
    }

    async fn apply_node(&self, op: Op, id: TaskId) -> Result<(TaskRecord, bool), ControlError> {
        match op {
            Op::Kill => {
                self.update(id, self.config.kill_lock_timeout(), |record| {
                    if record.transition == Transition::Complete {
                        return false;
                    }
                    record.state = StateName::kill();
                    record.transition = Transition::Paused;
                    true
                })
                .await
            }
            Op::Retry => {
                self.update(id, self.config.control_lock_timeout(), |record| {
                    if record.transition != Transition::Error {
                        return false;
                    }
                    record.transition = Transition::Paused;
                    record.last_error = None;
                    true
                })
                .await
            }
        }
    }

    /// HOLD a PAUSED or ERROR task. `false` when it was in any other transition.
    pub async fn hold(&self, id: TaskId) -> Result<bool, ControlError> {
        let (_, changed) = self
            .update(id, self.config.control_lock_timeout(), |record| {
                if !matches!(record.transition, Transition::Paused | Transition::Error) {
                    return false;
                }
                record.transition = Transition::Hold;
                true
            })
            .await?;
        Ok(changed)
    }

    /// HOLD back to PAUSED. `false` when the task was not on hold.
    pub async fn resume(&self, id: TaskId) -> Result<bool, ControlError> {
        let (_, changed) = self
            .update(id, self.config.control_lock_timeout(), |record| {
                if record.transition != Transition::Hold {
                    return false;
                }
                record.transition = Transition::Paused;
                true
            })
            .await?;
        Ok(changed)
    }

    /// Acquire, mutate, save only when `mutate` reports a change, release.
    async fn update<F>(
        &self,
        id: TaskId,
        timeout: Duration,
        mutate: F,
    ) -> Result<(TaskRecord, bool), ControlError>
    where
        F: FnOnce(&mut TaskRecord) -> bool + Send,
    {
        let mut record = self.locker.acquire(id, timeout).await?;
        let changed = mutate(&mut record);
        let saved = if changed {
            self.store.save(&record).await.map(|_| ())
        } else {
            Ok(())
        };
        let released = self.locker.release(id).await;
        saved?;
        Ok((released?, changed))
    }

    pub async fn info(&self, id: TaskId, long: bool) -> Result<TaskReport, ControlError> {
        let record = self.store.load(id).await?;
        let mut children = Vec::with_capacity(record.children.len());
        for child in &record.children {
            match self.store.load(*child).await {
                Ok(child) => children.push(child),
                Err(err) => warn!(task_id = %child, error = %err, "cannot load child"),
            }
        }
        Ok(TaskReport {
            record,
            children,
            long,
        })
    }

    /// Tasks ordered by id whose last activity is within the window; all of
    /// them when `hours_ago` is `None`.
    pub async fn show(&self, hours_ago: Option<u32>) -> Result<Vec<TaskRecord>, ControlError> {
        let records = self.store.list().await?;
        let Some(hours) = hours_ago else {
            return Ok(records);
        };
        let since = self.clock.now() - Duration::hours(i64::from(hours));
        Ok(records
            .into_iter()
            .filter(|r| r.last_activity() >= since)
            .collect())
    }

    pub async fn status(&self) -> Result<StatusSummary, ControlError> {
        let records = self.store.list().await?;
        Ok(StatusSummary::from_records(&records))
    }
}

impl ControlReport {
    fn record(&mut self, id: TaskId, changed: bool) {
        if changed {
            self.changed.push(id);
        } else {
            self.unchanged.push(id);
        }
    }
}

/// Human-readable `info` output.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub record: TaskRecord,
    pub children: Vec<TaskRecord>,
    pub long: bool,
}

fn timestamp(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
}

impl fmt::Display for TaskReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let r = &self.record;
        writeln!(f, "{} {}", r.id, r.task_type)?;
        writeln!(f, "  state:      {}", r.state)?;
        writeln!(f, "  transition: {}", r.transition)?;
        writeln!(f, "  created:    {}", r.created_at.to_rfc3339())?;
        writeln!(f, "  last step:  {}", timestamp(r.last_exec_at))?;
        match &r.lease {
            Some(lease) => writeln!(
                f,
                "  lock:       {} until {}",
                lease.holder,
                lease.expires_at.to_rfc3339()
            )?,
            None => writeln!(f, "  lock:       none")?,
        }
        if let Some(err) = &r.last_error {
            writeln!(f, "  last error: {err}")?;
        }
        if !r.children.is_empty() {
            let done = self.children.iter().filter(|c| c.done()).count();
            writeln!(f, "  children:   {} ({done} done)", r.children.len())?;
        }
        if !self.long {
            return Ok(());
        }

        writeln!(f, "  payload:")?;
        let payload = serde_json::to_string_pretty(&r.payload).map_err(|_| fmt::Error)?;
        for line in payload.lines() {
            writeln!(f, "    {line}")?;
        }
        for child in &self.children {
            writeln!(
                f,
                "  - {} {} {}/{}",
                child.id, child.task_type, child.state, child.transition
            )?;
        }
        Ok(())
    }
}
