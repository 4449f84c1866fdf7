//! Broker - application を受け入れられる resource の選別と順位付け
//!
//! 1. Filter: 要求 cores / memory / walltime がどれも上限を超えない resource だけ残す
//!    （必須フィールドが欠けた記述はログを出してスキップ）
//! 2. Refresh: 残った候補ごとに `get_resource_status` で占有状況を取り直す
//! 3. Rank: free slots の多い順 → 全体の queued が少ない順 → 自分の queued が少ない順
//!    → 自分の running が少ない順
//!
//! 呼び出し側は順位の高い候補から submit を試す（`Broker::submit`）。

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::domain::{
    Application, JobHandle, LrmsError, Resource, ResourceStatus, StepError,
};
use crate::ports::Lrms;

/// A resource that can run the application, with fresh occupancy.
#[derive(Clone)]
pub struct Candidate {
    pub resource: Resource,
    pub lrms: Arc<dyn Lrms>,
}

pub struct Broker {
    backends: Vec<Arc<dyn Lrms>>,
    user: String,
}

impl Broker {
    pub fn new(backends: Vec<Arc<dyn Lrms>>, user: impl Into<String>) -> Self {
        Self {
            backends,
            user: user.into(),
        }
    }

    /// Backend a job was submitted to.
    pub fn backend(&self, name: &str) -> Option<Arc<dyn Lrms>> {
        self.backends.iter().find(|b| b.name() == name).cloned()
    }

    pub async fn do_brokering(&self, app: &Application) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for lrms in &self.backends {
            let mut resource = match Resource::try_from(lrms.descriptor()) {
                Ok(resource) => resource,
                Err(err) => {
                    warn!(error = %err, "skipping invalid resource descriptor");
                    continue;
                }
            };
            if !resource.can_run(app) {
                debug!(resource = %resource.name, app = %app.name, "resource limits exceeded");
                continue;
            }
            match lrms.get_resource_status(&self.user).await {
                Ok(status) => resource.status = status,
                Err(err) => {
                    warn!(resource = %resource.name, error = %err, "cannot refresh resource status, skipping");
                    continue;
                }
            }
            candidates.push(Candidate {
                resource,
                lrms: Arc::clone(lrms),
            });
        }
        candidates.sort_by(|a, b| compare_status(&a.resource.status, &b.resource.status));
        candidates
    }

    /// Try candidates in rank order until one accepts the job.
    ///
    /// With no candidate at all this is `NoResources`. When every candidate
    /// refused, the most retryable refusal is returned (transient, then
    /// authentication, then anything else).
    pub async fn submit(&self, app: &Application) -> Result<JobHandle, StepError> {
        let candidates = self.do_brokering(app).await;
        let mut refusal: Option<LrmsError> = None;
        for candidate in candidates {
            match candidate.lrms.submit(app).await {
                Ok(job) => {
                    info!(resource = %candidate.resource.name, job = %job, app = %app.name, "job submitted");
                    return Ok(job);
                }
                Err(err) => {
                    warn!(resource = %candidate.resource.name, error = %err, "submission refused, trying next resource");
                    if refusal
                        .as_ref()
                        .is_none_or(|prev| retry_rank(&err) < retry_rank(prev))
                    {
                        refusal = Some(err);
                    }
                }
            }
        }
        match refusal {
            Some(err) => Err(StepError::Lrms(err)),
            None => Err(StepError::NoResources(app.name.clone())),
        }
    }
}

fn retry_rank(err: &LrmsError) -> u8 {
    match err {
        LrmsError::Transient(_) => 0,
        LrmsError::Authentication(_) => 1,
        _ => 2,
    }
}

/// Ranking comparator: `Less` sorts first.
pub fn compare_status(a: &ResourceStatus, b: &ResourceStatus) -> Ordering {
    b.free_slots
        .cmp(&a.free_slots)
        .then(a.total_queued.cmp(&b.total_queued))
        .then(a.user_queued.cmp(&b.user_queued))
        .then(a.user_running.cmp(&b.user_running))
}
