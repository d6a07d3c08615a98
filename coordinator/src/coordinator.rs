//! The operations the HTTP layer exposes, composed from the components.

use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use common::{
    expand_payloads, ClaimRequest, ClaimResponse, CompleteTaskRequest, CreateJobRequest,
    CreateJobResponse, CreateTaskRequest, CreateTaskResponse, FailTaskRequest, HealthResponse,
    HeartbeatRequest, HelloResponse, JobInfo, JobResults, SpotInfo, SpotList, TaskInfo,
};
use serde_json::Value;

use crate::aggregator::JobAggregator;
use crate::clock::Clock;
use crate::config::{Config, MAX_DURATION_SECS};
use crate::error::{CoordinatorError, Result};
use crate::failover::Reaper;
use crate::model::{CancelOutcome, CompleteOutcome, FailOutcome, Heartbeat, TaskReport};
use crate::scheduler::TaskScheduler;
use crate::store::Store;
use crate::tracker::SpotTracker;

pub const COORDINATOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    /// Used for jobs and tasks that do not set their own.
    pub max_attempts: i32,
    pub stuck_threshold: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            stuck_threshold: Duration::seconds(600),
            heartbeat_timeout: Duration::seconds(90),
        }
    }
}

fn secs(value: u64) -> Duration {
    let capped = value.min(MAX_DURATION_SECS);
    Duration::seconds(i64::try_from(capped).unwrap_or(i64::MAX / 1000))
}

impl From<&Config> for CoordinatorSettings {
    fn from(cfg: &Config) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            stuck_threshold: secs(cfg.stuck_threshold_secs),
            heartbeat_timeout: secs(cfg.heartbeat_timeout_secs),
        }
    }
}

pub struct Coordinator {
    store: Arc<dyn Store>,
    tracker: SpotTracker,
    scheduler: TaskScheduler,
    jobs: JobAggregator,
    reaper: Reaper,
    settings: CoordinatorSettings,
    started: Instant,
}

fn required(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::Validation(format!("{name} is required")));
    }
    Ok(())
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, settings: CoordinatorSettings) -> Self {
        let jobs = JobAggregator::new(store.clone(), clock.clone());
        let scheduler = TaskScheduler::new(store.clone(), clock.clone());
        let tracker = SpotTracker::new(store.clone(), clock.clone(), settings.heartbeat_timeout);
        let reaper = Reaper::new(store.clone(), clock, settings.stuck_threshold);
        Self {
            store,
            tracker,
            scheduler,
            jobs,
            reaper,
            settings,
            started: Instant::now(),
        }
    }

    pub fn tracker(&self) -> &SpotTracker {
        &self.tracker
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn jobs(&self) -> &JobAggregator {
        &self.jobs
    }

    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    /* ---------------- worker-facing ---------------- */

    pub async fn hello(&self, ip_address: &str) -> Result<HelloResponse> {
        let spot = self.tracker.register_spot(ip_address).await?;
        Ok(HelloResponse {
            spot_id: spot.id,
            coordinator_version: COORDINATOR_VERSION.to_string(),
        })
    }

    pub async fn heartbeat(&self, req: HeartbeatRequest, ip_address: &str) -> Result<SpotInfo> {
        let spot = self
            .tracker
            .heartbeat(Heartbeat {
                spot_id: req.spot_id,
                ip_address: ip_address.to_string(),
                cpu_load: req.cpu_load,
                running_tasks: req.running_tasks,
                total_cores: req.total_cores,
            })
            .await?;
        Ok(SpotInfo::from(&spot))
    }

    /// `maxTasks` must be positive; values above the batch ceiling are clamped.
    pub async fn claim(&self, req: ClaimRequest) -> Result<ClaimResponse> {
        required("spotId", &req.spot_id)?;
        let max_tasks = usize::try_from(req.max_tasks)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                CoordinatorError::Validation(format!(
                    "maxTasks must be at least 1, got {}",
                    req.max_tasks
                ))
            })?;
        let tasks = self.scheduler.claim(&req.spot_id, max_tasks).await?;
        Ok(ClaimResponse {
            tasks: tasks.iter().map(|t| t.to_claimed()).collect(),
        })
    }

    pub async fn complete(&self, task_id: &str, req: CompleteTaskRequest) -> Result<CompleteOutcome> {
        required("spotId", &req.spot_id)?;
        if req.runtime_ms < 0 {
            return Err(CoordinatorError::Validation(format!(
                "runtimeMs must not be negative, got {}",
                req.runtime_ms
            )));
        }
        let report = TaskReport {
            runtime_ms: req.runtime_ms,
            iter: req.iter,
            fopt: req.fopt,
            result: req.result,
        };
        self.scheduler
            .complete_idempotent(task_id, &req.spot_id, report)
            .await
    }

    pub async fn fail(&self, task_id: &str, req: FailTaskRequest) -> Result<FailOutcome> {
        required("spotId", &req.spot_id)?;
        let error = if req.error.trim().is_empty() {
            "unspecified error"
        } else {
            req.error.as_str()
        };
        self.scheduler
            .fail_idempotent(task_id, &req.spot_id, error, req.retriable)
            .await
    }

    /* ---------------- client-facing ---------------- */

    pub async fn create_job(&self, req: CreateJobRequest) -> Result<CreateJobResponse> {
        required("artifact", &req.artifact)?;
        let payloads = expand_payloads(&req)?;
        let max_attempts = req.max_attempts.unwrap_or(self.settings.max_attempts);
        let config = match &req.config {
            Some(config) => config.clone(),
            None => grid_config(&req),
        };

        let job = self
            .jobs
            .create_job(&req.artifact, config, payloads, max_attempts)
            .await?;
        Ok(CreateJobResponse {
            job_id: job.id,
            total_tasks: job.total_tasks,
        })
    }

    pub async fn get_job(&self, job_id: &str) -> Result<JobInfo> {
        self.jobs
            .get_job(job_id)
            .await?
            .map(|job| JobInfo::from(&job))
            .ok_or_else(|| CoordinatorError::NotFound(format!("job {job_id} not found")))
    }

    pub async fn job_results(&self, job_id: &str) -> Result<JobResults> {
        if self.jobs.get_job(job_id).await?.is_none() {
            return Err(CoordinatorError::NotFound(format!("job {job_id} not found")));
        }
        let tasks = self.jobs.results(job_id).await?;
        Ok(JobResults {
            job_id: job_id.to_string(),
            results: tasks.iter().map(|t| t.to_result()).collect(),
        })
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<CancelOutcome> {
        self.jobs.cancel(job_id).await
    }

    pub async fn create_task(&self, req: CreateTaskRequest) -> Result<CreateTaskResponse> {
        let max_attempts = req.max_attempts.unwrap_or(self.settings.max_attempts);
        let task = self
            .scheduler
            .submit(req.payload, req.priority, max_attempts)
            .await?;
        Ok(CreateTaskResponse { task_id: task.id })
    }

    pub async fn get_task(&self, task_id: &str) -> Result<TaskInfo> {
        self.scheduler
            .get_task(task_id)
            .await?
            .map(|t| TaskInfo::from(&t))
            .ok_or_else(|| CoordinatorError::NotFound(format!("task {task_id} not found")))
    }

    pub async fn list_spots(&self) -> Result<SpotList> {
        let spots = self.tracker.list_spots().await?;
        Ok(SpotList {
            spots: spots.iter().map(SpotInfo::from).collect(),
        })
    }

    pub async fn delete_spot(&self, spot_id: &str) -> Result<()> {
        if self.tracker.delete_spot(spot_id).await? {
            Ok(())
        } else {
            Err(CoordinatorError::NotFound(format!(
                "spot {spot_id} not found"
            )))
        }
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        let counts = self.store.count_tasks().await?;
        let active_spots = self.tracker.active_spots().await?;
        Ok(HealthResponse {
            status: "UP".to_string(),
            uptime: self.started.elapsed().as_secs(),
            active_spots,
            pending_tasks: counts.new,
            running_tasks: counts.running,
        })
    }
}

/// The grid part of a job request, stored as the job's config when the
/// client did not send one.
fn grid_config(req: &CreateJobRequest) -> Value {
    let grid = CreateJobRequest {
        payloads: None,
        config: None,
        max_attempts: None,
        ..req.clone()
    };
    serde_json::to_value(grid).unwrap_or(Value::Null)
}
