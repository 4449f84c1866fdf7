use serde::{Deserialize, Serialize};

/// What a job runs and what it asks of the resource.
///
/// `requested_memory` is MB per core, `requested_walltime` is seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: String,
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "one")]
    pub requested_cores: u32,
    #[serde(default)]
    pub requested_memory: u64,
    #[serde(default)]
    pub requested_walltime: u64,
}

fn one() -> u32 {
    1
}

impl Application {
    pub fn new(name: impl Into<String>, executable: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            arguments: Vec::new(),
            requested_cores: 1,
            requested_memory: 0,
            requested_walltime: 0,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cores(mut self, cores: u32) -> Self {
        self.requested_cores = cores;
        self
    }

    pub fn with_memory(mut self, mb_per_core: u64) -> Self {
        self.requested_memory = mb_per_core;
        self
    }

    pub fn with_walltime(mut self, secs: u64) -> Self {
        self.requested_walltime = secs;
        self
    }

    /// Same application under another name (fan-out children).
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}
