//! Status - ストア全体の集計（`bobbin status`）

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::{TaskRecord, Transition};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounts {
    pub paused: usize,
    pub running: usize,
    pub hold: usize,
    pub error: usize,
    pub complete: usize,
}

impl TransitionCounts {
    fn add(&mut self, transition: Transition) {
        match transition {
            Transition::Paused => self.paused += 1,
            Transition::Running => self.running += 1,
            Transition::Hold => self.hold += 1,
            Transition::Error => self.error += 1,
            Transition::Complete => self.complete += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.paused + self.running + self.hold + self.error + self.complete
    }
}

impl fmt::Display for TransitionCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "paused={} running={} hold={} error={} complete={}",
            self.paused, self.running, self.hold, self.error, self.complete
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub counts: TransitionCounts,
    /// Records currently carrying a lease.
    pub locked: usize,
    pub by_type: BTreeMap<String, TransitionCounts>,
}

impl StatusSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a TaskRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            summary.counts.add(record.transition);
            summary
                .by_type
                .entry(record.task_type.to_string())
                .or_default()
                .add(record.transition);
            if record.is_locked() {
                summary.locked += 1;
            }
        }
        summary
    }
}

impl fmt::Display for StatusSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} tasks ({} locked): {}",
            self.counts.total(),
            self.locked,
            self.counts
        )?;
        for (task_type, counts) in &self.by_type {
            writeln!(f, "  {task_type}: {counts}")?;
        }
        Ok(())
    }
}
