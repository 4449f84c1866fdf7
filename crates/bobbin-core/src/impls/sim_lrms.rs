//! SimulatedLrms - プロセス内で完結する Lrms 実装
//!
//! ジョブは `polls_to_finish` 回の `check_status` で終了する。
//! CLI のデモ設定とテストで使う。失敗はキューに積んで注入できる。
//!
//! 別プロセスが投入したジョブ（ID のプレフィックスがこの resource 名のもの）は
//! 最初に問い合わせがあった時点で採用し、そこからカウントを始める。

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::domain::{
    Application, Artifact, JobHandle, JobStatus, LrmsError, ResourceDescriptor, ResourceStatus,
};
use crate::ports::{Clock, Lrms, SystemClock};

/// `[[resources]]` entry of the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedResource {
    pub name: String,
    #[serde(default)]
    pub max_cores_per_job: Option<u32>,
    #[serde(default)]
    pub max_memory_per_core: Option<u64>,
    #[serde(default)]
    pub max_walltime: Option<u64>,
    #[serde(default = "default_total_slots")]
    pub total_slots: u32,
    #[serde(default = "default_polls_to_finish")]
    pub polls_to_finish: u32,
    /// Every job ends as FAILED instead of FINISHED.
    #[serde(default)]
    pub fail_jobs: bool,
}

fn default_total_slots() -> u32 {
    4
}

fn default_polls_to_finish() -> u32 {
    2
}

impl SimulatedResource {
    pub fn localhost() -> Self {
        Self {
            name: "localhost".into(),
            max_cores_per_job: Some(4),
            max_memory_per_core: Some(2048),
            max_walltime: Some(24 * 3600),
            total_slots: default_total_slots(),
            polls_to_finish: default_polls_to_finish(),
            fail_jobs: false,
        }
    }

    pub fn descriptor(&self) -> ResourceDescriptor {
        ResourceDescriptor {
            name: self.name.clone(),
            max_cores_per_job: self.max_cores_per_job,
            max_memory_per_core: self.max_memory_per_core,
            max_walltime: self.max_walltime,
        }
    }
}

#[derive(Debug)]
struct SimJob {
    app: String,
    polls: u32,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct SimState {
    jobs: HashMap<String, SimJob>,
    submit_failures: VecDeque<LrmsError>,
    status_failures: VecDeque<LrmsError>,
}

pub struct SimulatedLrms {
    config: SimulatedResource,
    /// All jobs of this backend belong to this user.
    owner: String,
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
}

impl SimulatedLrms {
    pub fn new(config: SimulatedResource, owner: impl Into<String>) -> Self {
        Self {
            config,
            owner: owner.into(),
            clock: Arc::new(SystemClock),
            state: Mutex::new(SimState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 次の `submit` を `err` で失敗させる
    pub async fn fail_next_submit(&self, err: LrmsError) {
        self.state.lock().await.submit_failures.push_back(err);
    }

    /// 次の `check_status` を `err` で失敗させる
    pub async fn fail_next_status(&self, err: LrmsError) {
        self.state.lock().await.status_failures.push_back(err);
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    fn owns(&self, job: &JobHandle) -> bool {
        job.resource == self.config.name
            && job.lrms_job_id.starts_with(&format!("{}-", self.config.name))
    }

    fn is_active(&self, job: &SimJob) -> bool {
        !job.cancelled && job.polls < self.config.polls_to_finish
    }
}

#[async_trait]
impl Lrms for SimulatedLrms {
    fn descriptor(&self) -> ResourceDescriptor {
        self.config.descriptor()
    }

    async fn submit(&self, app: &Application) -> Result<JobHandle, LrmsError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.submit_failures.pop_front() {
            return Err(err);
        }
        let lrms_job_id = format!("{}-{}", self.config.name, Ulid::new());
        state.jobs.insert(
            lrms_job_id.clone(),
            SimJob {
                app: app.name.clone(),
                polls: 0,
                cancelled: false,
            },
        );
        Ok(JobHandle {
            resource: self.config.name.clone(),
            lrms_job_id,
            submitted_at: self.clock.now(),
        })
    }

    async fn check_status(&self, job: &JobHandle) -> Result<JobStatus, LrmsError> {
        if !self.owns(job) {
            return Err(LrmsError::UnknownJob(job.lrms_job_id.clone()));
        }
        let mut state = self.state.lock().await;
        if let Some(err) = state.status_failures.pop_front() {
            return Err(err);
        }
        let sim = state
            .jobs
            .entry(job.lrms_job_id.clone())
            .or_insert_with(|| SimJob {
                app: String::new(),
                polls: 0,
                cancelled: false,
            });
        if sim.cancelled {
            return Ok(JobStatus::Deleted);
        }
        sim.polls = sim.polls.saturating_add(1);
        let status = if sim.polls >= self.config.polls_to_finish {
            if self.config.fail_jobs {
                JobStatus::Failed
            } else {
                JobStatus::Finished
            }
        } else if sim.polls == 1 {
            JobStatus::Submitted
        } else {
            JobStatus::Running
        };
        Ok(status)
    }

    async fn get_results(&self, job: &JobHandle) -> Result<Vec<Artifact>, LrmsError> {
        if !self.owns(job) {
            return Err(LrmsError::UnknownJob(job.lrms_job_id.clone()));
        }
        let state = self.state.lock().await;
        let (app, polls) = match state.jobs.get(&job.lrms_job_id) {
            Some(sim) if sim.cancelled => {
                return Err(LrmsError::Failed(format!("job {} was cancelled", job.lrms_job_id)));
            }
            Some(sim) => (sim.app.clone(), sim.polls),
            None => (String::new(), self.config.polls_to_finish),
        };
        Ok(vec![
            Artifact::Stdout(format!("{app} finished on {}", self.config.name)),
            Artifact::Json(serde_json::json!({
                "job": job.lrms_job_id,
                "polls": polls,
            })),
        ])
    }

    async fn cancel(&self, job: &JobHandle) -> Result<(), LrmsError> {
        if !self.owns(job) {
            return Err(LrmsError::UnknownJob(job.lrms_job_id.clone()));
        }
        let mut state = self.state.lock().await;
        let sim = state
            .jobs
            .entry(job.lrms_job_id.clone())
            .or_insert_with(|| SimJob {
                app: String::new(),
                polls: 0,
                cancelled: false,
            });
        sim.cancelled = true;
        Ok(())
    }

    async fn get_resource_status(&self, user: &str) -> Result<ResourceStatus, LrmsError> {
        let state = self.state.lock().await;
        let mut status = ResourceStatus::default();
        for job in state.jobs.values().filter(|j| self.is_active(j)) {
            let queued = job.polls == 0;
            if queued {
                status.total_queued += 1;
            } else {
                status.total_running += 1;
            }
            if user == self.owner {
                if queued {
                    status.user_queued += 1;
                } else {
                    status.user_running += 1;
                }
            }
        }
        status.free_slots = self
            .config
            .total_slots
            .saturating_sub(status.total_queued + status.total_running);
        Ok(status)
    }
}
