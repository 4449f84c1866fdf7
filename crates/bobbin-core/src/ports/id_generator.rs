//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: Clock の時刻から ULID を作る。同一プロセス内では単調増加

use std::sync::Mutex;
use std::time::SystemTime;

use crate::domain::{HolderId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は分散システムで使える ID を生成
///
/// # ULID の特性
/// - 時刻でソート可能（scheduler の id 降順走査 = 新しい順）
/// - 分散環境で生成可能（調整不要）
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
    fn generate_holder_id(&self) -> HolderId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// 同じミリ秒内で生成した ID も生成順に並ぶ（ulid::Generator の単調モード）。
/// 乱数部が溢れた場合だけ単調性を諦めてランダムな ULID にフォールバックする。
pub struct UlidGenerator<C> {
    clock: C,
    monotonic: Mutex<ulid::Generator>,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            monotonic: Mutex::new(ulid::Generator::new()),
        }
    }

    fn next_ulid(&self) -> Ulid {
        let now = self.clock.now();
        let mut generator = self.monotonic.lock().unwrap_or_else(|e| e.into_inner());
        match generator.generate_from_datetime(SystemTime::from(now)) {
            Ok(ulid) => ulid,
            Err(_) => Ulid::from_parts(now.timestamp_millis() as u64, rand::random()),
        }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.next_ulid())
    }

    fn generate_holder_id(&self) -> HolderId {
        HolderId::from(self.next_ulid())
    }
}
