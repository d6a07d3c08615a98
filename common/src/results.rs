use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{job::JobId, task::TaskId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResults {
    pub job_id: JobId,
    /// One entry per DONE task of the job.
    pub results: Vec<TaskResult>,
}

/// Execution fields reported by the spot, echoed back verbatim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub payload: serde_json::Value,
    pub runtime_ms: Option<i64>,
    pub iter: Option<i64>,
    pub fopt: Option<f64>,
    pub result: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}
