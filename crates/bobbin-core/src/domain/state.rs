//! Transition - scheduler から見た実行フェーズ
//!
//! `state` は kind ごとの業務上の位置、`transition` は scheduler が見る粗いフェーズ。
//!
//! ```text
//!            step 開始              handler Ok(false)
//!   PAUSED ───────────▶ RUNNING ─────────────────────▶ PAUSED
//!     ▲                    │  handler Ok(true)
//!     │ retry              ├───────────────────────▶ COMPLETE
//!     │                    │  handler Err / panic
//!   ERROR ◀────────────────┘
//!
//!   PAUSED / ERROR ── hold ──▶ HOLD ── resume ──▶ PAUSED   (operator only)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    /// Being stepped; the stepping party holds the lease.
    Running,
    /// Idle and eligible for the next scheduler pass.
    Paused,
    Error,
    Complete,
    /// Administrative pause, set only by an operator.
    Hold,
}

impl Transition {
    pub const ALL: [Transition; 5] = [
        Transition::Running,
        Transition::Paused,
        Transition::Error,
        Transition::Complete,
        Transition::Hold,
    ];

    /// Terminal transitions only change through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Transition::Error | Transition::Complete)
    }

    /// Whether the scheduler may pick the task up (lease permitting).
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Transition::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transition::Running => "RUNNING",
            Transition::Paused => "PAUSED",
            Transition::Error => "ERROR",
            Transition::Complete => "COMPLETE",
            Transition::Hold => "HOLD",
        }
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
