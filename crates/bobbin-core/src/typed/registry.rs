//! MachineRegistry - task kind の静的な登録表
//!
//! 起動時に kind を 1 つずつ `register` する。task_type 文字列からの動的解決はしない。
//!
//! # 学習ポイント
//! - BTreeMap での型消去された trait object の管理（走査順を安定させる）
//! - Generic methods での登録と型安全性
//! - Arc による共有所有権

use std::collections::BTreeMap;
use std::sync::Arc;

use super::kind::TaskKind;
use super::machine::{DynMachine, TypedMachine};
use crate::domain::{StateName, TaskType};

#[derive(Default)]
pub struct MachineRegistry {
    machines: BTreeMap<String, Arc<dyn DynMachine>>,
}

/// RegistryError は MachineRegistry の操作エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("task type '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("task type '{0}' is not registered")]
    NotRegistered(String),
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: TaskKind>(&mut self, kind: K) -> Result<(), RegistryError> {
        let task_type = K::TYPE.to_string();
        if self.machines.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.machines
            .insert(task_type, Arc::new(TypedMachine::new(kind)));
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn DynMachine>> {
        self.machines.get(task_type).cloned()
    }

    pub fn require(&self, task_type: &TaskType) -> Result<Arc<dyn DynMachine>, RegistryError> {
        self.get(task_type.as_str())
            .ok_or_else(|| RegistryError::NotRegistered(task_type.to_string()))
    }

    /// Registered types in name order.
    pub fn registered_types(&self) -> Vec<String> {
        self.machines.keys().cloned().collect()
    }

    pub fn task_types(&self) -> Vec<TaskType> {
        self.machines.keys().map(TaskType::new).collect()
    }

    /// Success state of a child's kind. Unregistered kinds fall back to COMPLETE.
    pub fn success_state_of(&self, task_type: &TaskType) -> StateName {
        self.get(task_type.as_str())
            .map(|m| m.success_state())
            .unwrap_or_else(StateName::complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Gather, Steps};

    #[test]
    fn register_and_get() {
        let mut registry = MachineRegistry::new();
        registry.register(Steps).unwrap();

        let machine = registry.get(Steps::TYPE).unwrap();
        assert_eq!(machine.task_type(), Steps::TYPE);
        assert!(registry.require(&TaskType::new(Steps::TYPE)).is_ok());
    }

    #[test]
    fn double_registration() {
        let mut registry = MachineRegistry::new();
        registry.register(Steps).unwrap();
        assert_eq!(
            registry.register(Steps),
            Err(RegistryError::AlreadyRegistered(Steps::TYPE.to_string()))
        );
    }

    #[test]
    fn registered_types_are_sorted() {
        let mut registry = MachineRegistry::new();
        registry.register(Steps).unwrap();
        registry.register(Gather).unwrap();

        let mut expected = vec![Steps::TYPE.to_string(), Gather::TYPE.to_string()];
        expected.sort();
        assert_eq!(registry.registered_types(), expected);
    }

    #[test]
    fn unknown_type_is_not_registered() {
        let registry = MachineRegistry::new();
        assert!(matches!(
            registry.require(&TaskType::new("nope.v1")),
            Err(RegistryError::NotRegistered(_))
        ));
        assert_eq!(
            registry.success_state_of(&TaskType::new("nope.v1")),
            StateName::complete()
        );
    }
}
