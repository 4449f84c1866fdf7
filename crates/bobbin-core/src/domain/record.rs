//! TaskRecord - 永続化される 1 タスク分のドキュメント

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Lease, StateName, TaskId, TaskType, Transition};

/// The durable unit of work.
///
/// `revision` is bumped by the store on every write; a save with a stale
/// revision is rejected. `lease == None` means unlocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: TaskType,
    pub state: StateName,
    pub transition: Transition,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_exec_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lease: Option<Lease>,
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TaskId>,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Rendered error of the step that moved the task to ERROR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl TaskRecord {
    pub fn new(
        id: TaskId,
        task_type: TaskType,
        state: StateName,
        payload: serde_json::Value,
        children: Vec<TaskId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            task_type,
            state,
            transition: Transition::Paused,
            created_at: now,
            last_exec_at: None,
            lease: None,
            revision: 0,
            children,
            payload,
            last_error: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lease.is_some()
    }

    /// PAUSED and unlocked. An expired lease still counts as held until
    /// `implicit_release` clears it.
    pub fn is_eligible(&self) -> bool {
        self.transition.is_schedulable() && !self.is_locked()
    }

    /// Transition is terminal or the state is COMPLETE/KILL.
    pub fn done(&self) -> bool {
        self.transition.is_terminal() || self.state.is_terminal()
    }

    /// Finished in the kind's designated success state.
    pub fn successful(&self, success_state: &StateName) -> bool {
        self.done() && self.transition == Transition::Complete && &self.state == success_state
    }

    /// Timestamp used for "recent activity" listings.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_exec_at.unwrap_or(self.created_at)
    }
}
