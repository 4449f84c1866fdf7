use serde::{Deserialize, Serialize};
use std::fmt;

/// Registered name of a task kind, e.g. `bobbin.single_job.v1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Stored form of a task's state (`READY`, `WAITING`, `KILL`, ...).
///
/// 値の集合は task kind ごとに定義される。ストア上は文字列のまま保持し、
/// step のたびに kind の state enum へ parse し直す。
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateName(String);

impl StateName {
    pub const COMPLETE: &'static str = "COMPLETE";
    pub const KILL: &'static str = "KILL";

    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn complete() -> Self {
        Self::new(Self::COMPLETE)
    }

    pub fn kill() -> Self {
        Self::new(Self::KILL)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// COMPLETE と KILL はすべての kind で終端
    pub fn is_terminal(&self) -> bool {
        self.0 == Self::COMPLETE || self.0 == Self::KILL
    }
}

impl fmt::Display for StateName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl PartialEq<&str> for StateName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
