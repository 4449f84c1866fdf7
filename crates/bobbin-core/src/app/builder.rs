//! EngineBuilder - engine の構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::sync::Arc;

use super::broker::Broker;
use super::engine::Engine;
use crate::config::EngineConfig;
use crate::impls::InMemoryTaskStore;
use crate::ports::{Clock, Lrms, SystemClock, TaskStore, UlidGenerator};
use crate::tasks::{FanOut, SingleJob, TaskTree};
use crate::typed::{MachineRegistry, RegistryError, TaskKind};

/// EngineBuilder は Engine を構築
///
/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new()
///     .store(Arc::new(FileTaskStore::open("tasks.json").await?))
///     .with_builtin_tasks()?
///     .register(MyKind)?
///     .expect_tasks(&["acme.my_kind.v1"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - expect_tasks() で期待される task_type を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - 不足があれば BuildError を返す
pub struct EngineBuilder {
    registry: MachineRegistry,
    expected_tasks: Option<Vec<String>>,
    store: Arc<dyn TaskStore>,
    backends: Vec<Arc<dyn Lrms>>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

/// BuildError は engine 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),
}

impl EngineBuilder {
    /// In-memory store, system clock, default config, no backends.
    pub fn new() -> Self {
        Self {
            registry: MachineRegistry::new(),
            expected_tasks: None,
            store: Arc::new(InMemoryTaskStore::new()),
            backends: Vec::new(),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn register<K: TaskKind>(mut self, kind: K) -> Result<Self, RegistryError> {
        self.registry.register(kind)?;
        Ok(self)
    }

    /// SingleJob, FanOut and TaskTree.
    pub fn with_builtin_tasks(self) -> Result<Self, RegistryError> {
        self.register(SingleJob)?.register(FanOut)?.register(TaskTree)
    }

    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = store;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn backend(mut self, lrms: Arc<dyn Lrms>) -> Self {
        self.backends.push(lrms);
        self
    }

    pub fn backends(mut self, backends: impl IntoIterator<Item = Arc<dyn Lrms>>) -> Self {
        self.backends.extend(backends);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        if let Some(expected_tasks) = &self.expected_tasks {
            let registered_types = self.registry.registered_types();
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|x| !registered_types.contains(x))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }
        let broker = Broker::new(self.backends, self.config.user.clone());
        let ids = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));
        Ok(Engine::from_parts(
            self.store,
            self.registry,
            broker,
            self.clock,
            ids,
            self.config,
        ))
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
