pub mod expand;
pub mod job;
pub mod results;
pub mod spot;
pub mod task;

pub use expand::{expand_payloads, ExpandError, ParamRange};
pub use job::{CancelJobResponse, CreateJobRequest, CreateJobResponse, JobId, JobInfo, JobStatus};
pub use results::{JobResults, TaskResult};
pub use spot::{
    HeartbeatRequest, HeartbeatResponse, HelloResponse, SpotId, SpotInfo, SpotList, SpotStatus,
};
pub use task::{
    ClaimRequest, ClaimResponse, ClaimedTask, CompleteTaskRequest, CompleteTaskResponse,
    CreateTaskRequest, CreateTaskResponse, FailTaskRequest, FailTaskResponse, TaskId, TaskInfo,
    TaskStatus,
};

use serde::{Deserialize, Serialize};

/// Header carrying the shared secret on every `/internal` call.
pub const AGENT_KEY_HEADER: &str = "X-Orhestra-Key";

/// Hard ceiling on how many tasks a single claim may lease.
pub const MAX_CLAIM_BATCH: i32 = 10;

/// A status string that does not name any known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status `{0}`")]
pub struct UnknownStatus(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    /// Seconds since the coordinator started.
    pub uptime: u64,
    pub active_spots: i64,
    pub pending_tasks: i64,
    pub running_tasks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
