//! Lease - task record 上の排他ロック
//!
//! ロックは (holder, expiry) の組。`expires_at` を過ぎた lease は
//! `implicit_release` によって回収される（holder がクラッシュしたケースの復旧手段）。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::HolderId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: HolderId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: HolderId, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            holder,
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_held_by(&self, holder: HolderId) -> bool {
        self.holder == holder
    }
}
