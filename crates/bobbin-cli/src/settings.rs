//! 設定ファイル（TOML）
//!
//! ```toml
//! [engine]
//! lease_ttl_secs = 300
//! step_workers = 0
//!
//! [store]
//! path = "/var/lib/bobbin/tasks.json"
//!
//! [[resources]]
//! kind = "simulated"
//! name = "cluster-a"
//! max_cores_per_job = 16
//! max_memory_per_core = 4096
//! max_walltime = 86400
//! total_slots = 64
//!
//! [[resources]]
//! kind = "sge"
//! name = "grid"
//! max_cores_per_job = 32
//! spool_dir = "/home/alice/spool"
//! parallel_environment = "smp"
//! ```
//!
//! ファイルが無ければ既定値 + `localhost` の simulated resource 1 つ。

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bobbin_core::EngineConfig;
use bobbin_core::impls::{BatchConfig, BatchLrms, LocalExecutor, SimulatedLrms, SimulatedResource};
use bobbin_core::ports::Lrms;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineConfig,
    pub store: StoreSettings,
    pub resources: Vec<ResourceSettings>,
}

/// One `[[resources]]` entry, selected by `kind`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ResourceSettings {
    Simulated(SimulatedResource),
    /// Grid Engine through local `qsub`/`qstat`.
    Sge(BatchConfig),
}

impl ResourceSettings {
    pub fn name(&self) -> &str {
        match self {
            Self::Simulated(resource) => &resource.name,
            Self::Sge(config) => &config.descriptor.name,
        }
    }

    pub fn into_lrms(self, user: &str) -> Arc<dyn Lrms> {
        match self {
            Self::Simulated(resource) => Arc::new(SimulatedLrms::new(resource, user.to_string())),
            Self::Sge(config) => Arc::new(BatchLrms::new(LocalExecutor, config)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub path: PathBuf,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            path: bobbin_home().join("tasks.json"),
        }
    }
}

/// `~/.bobbin`, or `./.bobbin` without a home directory.
pub fn bobbin_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".bobbin")
}

pub fn default_config_path() -> PathBuf {
    bobbin_home().join("bobbin.toml")
}

impl Settings {
    /// An explicit path must exist; the default one may be missing.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = default_config_path();
                if !path.exists() {
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Configured resources, or `localhost` when none are.
    pub fn resources(&self) -> Vec<ResourceSettings> {
        if self.resources.is_empty() {
            vec![ResourceSettings::Simulated(SimulatedResource::localhost())]
        } else {
            self.resources.clone()
        }
    }

    /// Scheduler single-instance lock next to the store.
    pub fn scheduler_lock_path(&self) -> PathBuf {
        let mut name = self
            .store
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "tasks".into());
        name.push(".scheduler.lock");
        self.store.path.with_file_name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults_and_localhost() {
        let settings = Settings::parse("").unwrap();
        assert_eq!(settings.engine, EngineConfig::default());
        assert_eq!(
            settings.resources(),
            vec![ResourceSettings::Simulated(SimulatedResource::localhost())]
        );
    }

    #[test]
    fn home_is_dot_bobbin() {
        let home = bobbin_home();
        assert!(home.ends_with(".bobbin"));
        if let Some(dir) = dirs::home_dir() {
            assert_eq!(home, dir.join(".bobbin"));
        }
        assert_eq!(default_config_path(), home.join("bobbin.toml"));
    }

    #[test]
    fn full_file() {
        let settings = Settings::parse(
            r#"
            [engine]
            lease_ttl_secs = 60
            step_workers = 4
            user = "carol"

            [store]
            path = "/tmp/bobbin/tasks.json"

            [[resources]]
            kind = "simulated"
            name = "cluster-a"
            max_cores_per_job = 16
            max_memory_per_core = 4096
            max_walltime = 86400
            total_slots = 64

            [[resources]]
            kind = "simulated"
            name = "flaky"
            fail_jobs = true

            [[resources]]
            kind = "sge"
            name = "grid"
            max_cores_per_job = 32
            spool_dir = "/home/alice/spool"
            parallel_environment = "smp"
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine.lease_ttl_secs, 60);
        assert_eq!(settings.engine.step_workers, 4);
        assert_eq!(settings.engine.user, "carol");
        assert_eq!(settings.engine.kill_lock_timeout_secs, 120);
        assert_eq!(settings.store.path, PathBuf::from("/tmp/bobbin/tasks.json"));

        let resources = settings.resources();
        assert_eq!(resources.len(), 3);
        let names: Vec<&str> = resources.iter().map(ResourceSettings::name).collect();
        assert_eq!(names, ["cluster-a", "flaky", "grid"]);
        let [
            ResourceSettings::Simulated(cluster),
            ResourceSettings::Simulated(flaky),
            ResourceSettings::Sge(grid),
        ] = resources.as_slice()
        else {
            panic!("unexpected kinds: {resources:?}");
        };
        assert_eq!(cluster.total_slots, 64);
        assert_eq!(flaky.max_cores_per_job, None);
        assert!(flaky.fail_jobs);
        assert_eq!(flaky.polls_to_finish, 2);
        assert_eq!(grid.descriptor.max_cores_per_job, Some(32));
        assert_eq!(grid.descriptor.max_walltime, None);
        assert_eq!(grid.spool_dir, "/home/alice/spool");
        assert_eq!(grid.parallel_environment.as_deref(), Some("smp"));
    }

    #[test]
    fn sge_resource_builds_batch_backend() {
        let settings = Settings::parse(
            "[[resources]]\nkind = \"sge\"\nname = \"grid\"\nspool_dir = \"/tmp\"\n",
        )
        .unwrap();
        let lrms = settings.resources().remove(0).into_lrms("alice");
        assert_eq!(lrms.descriptor().name, "grid");
    }

    #[test]
    fn resource_without_kind_is_rejected() {
        assert!(Settings::parse("[[resources]]\nname = \"cluster-a\"\n").is_err());
        assert!(Settings::parse("[[resources]]\nkind = \"pbs\"\nname = \"x\"\n").is_err());
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(Settings::parse("[engine]\nlease_ttl_secs = \"soon\"").is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bobbin.toml");
        std::fs::write(&path, "[store]\npath = \"x/tasks.json\"\n").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.store.path, PathBuf::from("x/tasks.json"));
        assert_eq!(
            settings.scheduler_lock_path(),
            PathBuf::from("x/tasks.json.scheduler.lock")
        );
    }
}
