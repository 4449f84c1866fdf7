//! Domain model (IDs, records, leases, resources, jobs, errors).
//!
//! ストレージやバックエンドには依存しない純粋なデータ型のみ。

pub mod application;
pub mod errors;
pub mod ids;
pub mod job;
pub mod lease;
pub mod record;
pub mod resource;
pub mod state;
pub mod task;

pub use application::Application;
pub use errors::{
    ControlError, EngineError, LrmsError, ResourceError, StepError, StoreError,
};
pub use ids::{HolderId, ParseIdError, TaskId};
pub use job::{Artifact, JobHandle, JobStatus};
pub use lease::Lease;
pub use record::TaskRecord;
pub use resource::{Resource, ResourceDescriptor, ResourceStatus};
pub use state::Transition;
pub use task::{StateName, TaskType};
