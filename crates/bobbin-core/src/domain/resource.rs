//! Resource - 実行バックエンドの容量と占有状況
//!
//! `ResourceDescriptor` は設定やバックエンドから来る未検証の記述で、
//! 必須フィールドが欠けていれば `Resource` への変換が `ResourceError::MissingField` になる。
//! Broker は変換に失敗した記述をログに残してスキップする。

use serde::{Deserialize, Serialize};

use super::Application;
use super::errors::ResourceError;

/// Unvalidated resource description.
///
/// Memory is in MB per core, walltime in seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub name: String,
    #[serde(default)]
    pub max_cores_per_job: Option<u32>,
    #[serde(default)]
    pub max_memory_per_core: Option<u64>,
    #[serde(default)]
    pub max_walltime: Option<u64>,
}

/// Dynamic occupancy counters, refreshed from the backend before ranking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub free_slots: u32,
    pub total_queued: u32,
    pub total_running: u32,
    pub user_queued: u32,
    pub user_running: u32,
}

/// A validated resource: static limits plus the last known occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub name: String,
    pub max_cores_per_job: u32,
    pub max_memory_per_core: u64,
    pub max_walltime: u64,
    pub status: ResourceStatus,
}

impl Resource {
    /// The application's requests do not exceed any advertised maximum.
    pub fn can_run(&self, app: &Application) -> bool {
        app.requested_cores <= self.max_cores_per_job
            && app.requested_memory <= self.max_memory_per_core
            && app.requested_walltime <= self.max_walltime
    }
}

impl TryFrom<ResourceDescriptor> for Resource {
    type Error = ResourceError;

    fn try_from(d: ResourceDescriptor) -> Result<Self, Self::Error> {
        let missing = |field: &'static str| ResourceError::MissingField {
            resource: d.name.clone(),
            field,
        };
        if d.name.is_empty() {
            return Err(missing("name"));
        }
        let max_cores_per_job = d.max_cores_per_job.ok_or_else(|| missing("max_cores_per_job"))?;
        let max_memory_per_core = d
            .max_memory_per_core
            .ok_or_else(|| missing("max_memory_per_core"))?;
        let max_walltime = d.max_walltime.ok_or_else(|| missing("max_walltime"))?;

        Ok(Self {
            name: d.name,
            max_cores_per_job,
            max_memory_per_core,
            max_walltime,
            status: ResourceStatus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor {
            name: "cluster".into(),
            max_cores_per_job: Some(8),
            max_memory_per_core: Some(2048),
            max_walltime: Some(3600),
        }
    }

    #[test]
    fn complete_descriptor_converts() {
        let r = Resource::try_from(descriptor()).unwrap();
        assert_eq!(r.max_cores_per_job, 8);
        assert_eq!(r.status, ResourceStatus::default());
    }

    #[rstest]
    #[case::cores(ResourceDescriptor { max_cores_per_job: None, ..descriptor() }, "max_cores_per_job")]
    #[case::memory(ResourceDescriptor { max_memory_per_core: None, ..descriptor() }, "max_memory_per_core")]
    #[case::walltime(ResourceDescriptor { max_walltime: None, ..descriptor() }, "max_walltime")]
    #[case::name(ResourceDescriptor { name: String::new(), ..descriptor() }, "name")]
    fn missing_field_is_rejected(#[case] d: ResourceDescriptor, #[case] expected: &str) {
        let err = Resource::try_from(d).unwrap_err();
        assert!(matches!(err, ResourceError::MissingField { field, .. } if field == expected));
    }

    #[rstest]
    #[case::fits(8, 2048, 3600, true)]
    #[case::too_many_cores(9, 1, 1, false)]
    #[case::too_much_memory(1, 4096, 1, false)]
    #[case::too_long(1, 1, 7200, false)]
    fn can_run_checks_every_limit(
        #[case] cores: u32,
        #[case] memory: u64,
        #[case] walltime: u64,
        #[case] expected: bool,
    ) {
        let r = Resource::try_from(descriptor()).unwrap();
        let app = Application::new("fit", "true")
            .with_cores(cores)
            .with_memory(memory)
            .with_walltime(walltime);
        assert_eq!(r.can_run(&app), expected);
    }
}
