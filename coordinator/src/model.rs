//! Value snapshots of the three persisted entities.
//!
//! Snapshots are handed out by the store and never written back field by
//! field: every mutation goes through a named store operation. The
//! `pub(crate)` mutators below exist so that store implementations share one
//! definition of each transition.

use chrono::{DateTime, Utc};
use common::{
    ClaimedTask, JobId, JobInfo, JobStatus, SpotId, SpotInfo, SpotStatus, TaskId, TaskInfo,
    TaskResult, TaskStatus,
};
use serde_json::Value;

use crate::error::{CoordinatorError, Result};

/* ---------------- jobs ---------------- */

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub artifact: String,
    pub config: Value,
    pub status: JobStatus,
    pub total_tasks: i32,
    pub completed_tasks: i32,
    pub failed_tasks: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Which per-job counter a terminal task transition bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCounter {
    Completed,
    Failed,
}

/// Result of bumping a job counter.
#[derive(Debug, Clone)]
pub struct CounterUpdate {
    pub job: Job,
    /// True when this bump moved the job into COMPLETED or FAILED.
    pub settled: bool,
}

impl Job {
    pub fn new(
        artifact: impl Into<String>,
        config: Value,
        total_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let artifact = artifact.into();
        if artifact.trim().is_empty() {
            return Err(CoordinatorError::Validation(
                "artifact must not be empty".into(),
            ));
        }
        let total_tasks = i32::try_from(total_tasks)
            .map_err(|_| CoordinatorError::Validation("too many tasks for one job".into()))?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            artifact,
            config,
            status: JobStatus::Pending,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
        })
    }

    /// The terminal status the counters call for, if they are complete.
    pub fn settled_status(&self) -> Option<JobStatus> {
        if self.completed_tasks + self.failed_tasks < self.total_tasks {
            return None;
        }
        if self.failed_tasks == 0 {
            Some(JobStatus::Completed)
        } else {
            Some(JobStatus::Failed)
        }
    }

    /// PENDING -> RUNNING on the first claim of one of its tasks.
    pub(crate) fn mark_started(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
            self.started_at.get_or_insert(now);
        }
    }

    /// Bumps one counter and settles the job if the counters are complete.
    /// Returns true only for the bump that settled it.
    pub(crate) fn record_outcome(&mut self, counter: JobCounter, now: DateTime<Utc>) -> bool {
        if self.completed_tasks + self.failed_tasks < self.total_tasks {
            match counter {
                JobCounter::Completed => self.completed_tasks += 1,
                JobCounter::Failed => self.failed_tasks += 1,
            }
        }
        if self.status.is_terminal() {
            return false;
        }
        match self.settled_status() {
            Some(status) => {
                self.status = status;
                self.finished_at = Some(now);
                true
            }
            None => false,
        }
    }
}

impl From<&Job> for JobInfo {
    fn from(job: &Job) -> Self {
        JobInfo {
            job_id: job.id.clone(),
            artifact: job.artifact.clone(),
            config: job.config.clone(),
            status: job.status,
            total_tasks: job.total_tasks,
            completed_tasks: job.completed_tasks,
            failed_tasks: job.failed_tasks,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

/* ---------------- tasks ---------------- */

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub job_id: Option<JobId>,
    pub payload: Value,
    pub status: TaskStatus,
    pub assigned_to: Option<SpotId>,
    pub priority: i32,
    pub attempts: i32,
    pub max_attempts: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub runtime_ms: Option<i64>,
    pub iter: Option<i64>,
    pub fopt: Option<f64>,
    pub result: Option<String>,
}

/// Execution fields a spot reports on success.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskReport {
    pub runtime_ms: i64,
    pub iter: Option<i64>,
    pub fopt: Option<f64>,
    pub result: Option<String>,
}

/// The exact row state a conditional transition expects to find.
///
/// `attempts` acts as a fencing token: a task that was released and claimed
/// again in between no longer matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskGuard {
    pub status: TaskStatus,
    pub assigned_to: Option<SpotId>,
    pub attempts: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskTransition {
    /// RUNNING -> DONE, ownership kept for audit.
    Complete(TaskReport),
    /// RUNNING -> NEW, ownership cleared, attempts preserved.
    Requeue,
    /// RUNNING -> FAILED.
    Fail { error: String },
}

impl TaskTransition {
    /// What to do with a RUNNING task whose holder went silent: requeue it
    /// while attempts remain, otherwise fail it.
    pub fn recover(task: &Task, cause: &str) -> Self {
        if task.can_retry() {
            TaskTransition::Requeue
        } else {
            TaskTransition::Fail {
                error: format!(
                    "max attempts exceeded: {} after {} of {} attempts",
                    cause, task.attempts, task.max_attempts
                ),
            }
        }
    }

    /// The job counter a transition bumps; `None` for a requeue.
    pub fn job_counter(&self) -> Option<JobCounter> {
        match self {
            TaskTransition::Complete(_) => Some(JobCounter::Completed),
            TaskTransition::Fail { .. } => Some(JobCounter::Failed),
            TaskTransition::Requeue => None,
        }
    }
}

/// An applied task transition.
#[derive(Debug, Clone)]
pub struct Transitioned {
    pub task: Task,
    /// The job counter bump made in the same store operation, present for
    /// terminal transitions of tasks that belong to a job.
    pub job: Option<CounterUpdate>,
}

impl Task {
    pub fn new(
        job_id: Option<JobId>,
        payload: Value,
        priority: i32,
        max_attempts: i32,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if max_attempts < 1 {
            return Err(CoordinatorError::Validation(format!(
                "maxAttempts must be at least 1, got {max_attempts}"
            )));
        }
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id,
            payload,
            status: TaskStatus::New,
            assigned_to: None,
            priority,
            attempts: 0,
            max_attempts,
            error_message: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            runtime_ms: None,
            iter: None,
            fopt: None,
            result: None,
        })
    }

    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    pub fn guard(&self) -> TaskGuard {
        TaskGuard {
            status: self.status,
            assigned_to: self.assigned_to.clone(),
            attempts: self.attempts,
        }
    }

    pub(crate) fn matches(&self, guard: &TaskGuard) -> bool {
        self.status == guard.status
            && self.assigned_to == guard.assigned_to
            && self.attempts == guard.attempts
    }

    /// NEW -> RUNNING for `spot_id`.
    pub(crate) fn claim(&mut self, spot_id: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Running;
        self.assigned_to = Some(spot_id.to_string());
        self.started_at = Some(now);
        self.attempts += 1;
    }

    /// Back to NEW without consuming an attempt.
    pub(crate) fn release(&mut self) {
        self.status = TaskStatus::New;
        self.assigned_to = None;
        self.started_at = None;
        self.error_message = None;
    }

    pub(crate) fn apply(&mut self, transition: &TaskTransition, now: DateTime<Utc>) {
        match transition {
            TaskTransition::Complete(report) => {
                self.status = TaskStatus::Done;
                self.finished_at = Some(now);
                self.error_message = None;
                self.runtime_ms = Some(report.runtime_ms);
                self.iter = report.iter;
                self.fopt = report.fopt;
                self.result = report.result.clone();
            }
            TaskTransition::Requeue => self.release(),
            TaskTransition::Fail { error } => {
                self.status = TaskStatus::Failed;
                self.finished_at = Some(now);
                self.error_message = Some(error.clone());
            }
        }
    }

    pub fn to_claimed(&self) -> ClaimedTask {
        ClaimedTask {
            task_id: self.id.clone(),
            payload: self.payload.clone(),
        }
    }

    pub fn to_result(&self) -> TaskResult {
        TaskResult {
            task_id: self.id.clone(),
            payload: self.payload.clone(),
            runtime_ms: self.runtime_ms,
            iter: self.iter,
            fopt: self.fopt,
            result: self.result.clone(),
            finished_at: self.finished_at,
        }
    }
}

impl From<&Task> for TaskInfo {
    fn from(t: &Task) -> Self {
        TaskInfo {
            task_id: t.id.clone(),
            job_id: t.job_id.clone(),
            payload: t.payload.clone(),
            status: t.status,
            assigned_to: t.assigned_to.clone(),
            priority: t.priority,
            attempts: t.attempts,
            max_attempts: t.max_attempts,
            error_message: t.error_message.clone(),
            created_at: t.created_at,
            started_at: t.started_at,
            finished_at: t.finished_at,
            runtime_ms: t.runtime_ms,
            iter: t.iter,
            fopt: t.fopt,
            result: t.result.clone(),
        }
    }
}

/// Number of tasks per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub new: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus, n: i64) {
        match status {
            TaskStatus::New => self.new += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Done => self.done += n,
            TaskStatus::Failed => self.failed += n,
            TaskStatus::Cancelled => self.cancelled += n,
        }
    }
}

/* ---------------- spots ---------------- */

#[derive(Debug, Clone, PartialEq)]
pub struct Spot {
    pub id: SpotId,
    pub ip_address: String,
    pub cpu_load: f64,
    pub running_tasks: i32,
    pub total_cores: i32,
    pub status: SpotStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Dynamic fields carried by one heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub spot_id: SpotId,
    pub ip_address: String,
    pub cpu_load: f64,
    pub running_tasks: i32,
    pub total_cores: i32,
}

impl Spot {
    /// A freshly registered spot with a coordinator-assigned id.
    pub fn register(ip_address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            ip_address: ip_address.into(),
            cpu_load: 0.0,
            running_tasks: 0,
            total_cores: 0,
            status: SpotStatus::Up,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub(crate) fn from_heartbeat(hb: &Heartbeat, now: DateTime<Utc>) -> Self {
        Self {
            id: hb.spot_id.clone(),
            ip_address: hb.ip_address.clone(),
            cpu_load: hb.cpu_load,
            running_tasks: hb.running_tasks,
            total_cores: hb.total_cores,
            status: SpotStatus::Up,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub(crate) fn apply_heartbeat(&mut self, hb: &Heartbeat, now: DateTime<Utc>) {
        self.ip_address = hb.ip_address.clone();
        self.cpu_load = hb.cpu_load;
        self.running_tasks = hb.running_tasks;
        self.total_cores = hb.total_cores;
        self.status = SpotStatus::Up;
        self.last_heartbeat = now;
    }
}

impl From<&Spot> for SpotInfo {
    fn from(s: &Spot) -> Self {
        SpotInfo {
            spot_id: s.id.clone(),
            ip_address: s.ip_address.clone(),
            cpu_load: s.cpu_load,
            running_tasks: s.running_tasks,
            total_cores: s.total_cores,
            status: s.status,
            last_heartbeat: s.last_heartbeat,
            registered_at: s.registered_at,
        }
    }
}

/* ---------------- outcomes ---------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    AlreadyDone,
    NotFound,
    WrongSpot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retried,
    Failed,
    AlreadyTerminal,
    NotFound,
    WrongSpot,
}

#[derive(Debug, Clone)]
pub enum CancelOutcome {
    Cancelled { job: Job, cancelled_tasks: u64 },
    AlreadyTerminal(JobStatus),
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn job_with(total: usize) -> Job {
        Job::new("opt.jar", json!({}), total, Utc::now()).unwrap()
    }

    #[test]
    fn job_settles_completed_without_failures() {
        let mut job = job_with(2);
        let now = Utc::now();
        assert!(!job.record_outcome(JobCounter::Completed, now));
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.record_outcome(JobCounter::Completed, now));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.finished_at, Some(now));
    }

    #[test]
    fn job_settles_failed_with_any_failure() {
        let mut job = job_with(2);
        let now = Utc::now();
        job.record_outcome(JobCounter::Failed, now);
        assert!(job.record_outcome(JobCounter::Completed, now));
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn settled_job_ignores_extra_outcomes() {
        let mut job = job_with(1);
        let now = Utc::now();
        assert!(job.record_outcome(JobCounter::Completed, now));
        assert!(!job.record_outcome(JobCounter::Failed, now));
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.completed_tasks + job.failed_tasks, 1);
    }

    #[test]
    fn cancelled_job_keeps_counting_but_not_settling() {
        let mut job = job_with(1);
        job.status = JobStatus::Cancelled;
        assert!(!job.record_outcome(JobCounter::Completed, Utc::now()));
        assert_eq!(job.completed_tasks, 1);
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[test]
    fn mark_started_only_moves_pending_jobs() {
        let mut job = job_with(1);
        let first = Utc::now();
        job.mark_started(first);
        assert_eq!(job.status, JobStatus::Running);
        job.mark_started(first + chrono::Duration::seconds(5));
        assert_eq!(job.started_at, Some(first));
    }

    #[test]
    fn empty_artifact_is_rejected() {
        assert!(Job::new(" ", json!({}), 1, Utc::now()).is_err());
    }

    #[test]
    fn task_claim_and_release_preserve_attempts() {
        let now = Utc::now();
        let mut task = Task::new(None, json!("p"), 0, 2, now).unwrap();
        assert!(task.can_retry());
        task.claim("spot-a", now);
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.assigned_to.as_deref(), Some("spot-a"));
        assert_eq!(task.attempts, 1);
        task.release();
        assert_eq!(task.status, TaskStatus::New);
        assert!(task.assigned_to.is_none());
        assert!(task.started_at.is_none());
        assert_eq!(task.attempts, 1);
        task.claim("spot-b", now);
        assert!(!task.can_retry());
    }

    #[test]
    fn guard_detects_reclaim() {
        let now = Utc::now();
        let mut task = Task::new(None, json!("p"), 0, 3, now).unwrap();
        task.claim("spot-a", now);
        let guard = task.guard();
        task.release();
        task.claim("spot-a", now);
        assert!(!task.matches(&guard));
    }

    #[test]
    fn recovery_requeues_until_attempts_run_out() {
        let now = Utc::now();
        let mut task = Task::new(None, json!("p"), 0, 2, now).unwrap();
        task.claim("spot-a", now);
        assert_eq!(
            TaskTransition::recover(&task, "spot spot-a went DOWN"),
            TaskTransition::Requeue
        );

        task.release();
        task.claim("spot-b", now);
        match TaskTransition::recover(&task, "spot spot-b went DOWN") {
            TaskTransition::Fail { error } => {
                assert_eq!(
                    error,
                    "max attempts exceeded: spot spot-b went DOWN after 2 of 2 attempts"
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(TaskTransition::Requeue.job_counter(), None);
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        assert!(Task::new(None, json!(null), 0, 0, Utc::now()).is_err());
    }
}
