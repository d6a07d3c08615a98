use std::sync::Arc;

use common::TaskStatus;
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{CoordinatorError, Result};
use crate::model::{CancelOutcome, CounterUpdate, Job, Task};
use crate::store::Store;

/// Logs the job-side effect of a terminal task transition. The store bumps
/// the counter in the same operation that moved the task.
pub fn log_progress(update: &CounterUpdate) {
    let job = &update.job;
    if update.settled {
        info!(
            "job {} finished {}: completed={} failed={} total={}",
            job.id, job.status, job.completed_tasks, job.failed_tasks, job.total_tasks
        );
    } else {
        debug!(
            "job {} progress: completed={} failed={} total={}",
            job.id, job.completed_tasks, job.failed_tasks, job.total_tasks
        );
    }
}

/// Owns job-level bookkeeping: creation, results and cancellation.
#[derive(Clone)]
pub struct JobAggregator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl JobAggregator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Persists a PENDING job and one NEW task per payload.
    ///
    /// Earlier payloads get higher priority, so within a job they are
    /// claimed in submission order.
    pub async fn create_job(
        &self,
        artifact: &str,
        config: Value,
        payloads: Vec<Value>,
        max_attempts: i32,
    ) -> Result<Job> {
        if payloads.is_empty() {
            return Err(CoordinatorError::Validation(
                "a job needs at least one payload".into(),
            ));
        }
        let now = self.clock.now();
        let job = Job::new(artifact, config, payloads.len(), now)?;

        let tasks = payloads
            .into_iter()
            .enumerate()
            .map(|(i, payload)| {
                let priority = -i32::try_from(i).unwrap_or(i32::MAX);
                Task::new(Some(job.id.clone()), payload, priority, max_attempts, now)
            })
            .collect::<Result<Vec<_>>>()?;

        self.store.insert_job(&job, &tasks).await?;
        info!(
            "job {} created: artifact={} tasks={} max_attempts={}",
            job.id, job.artifact, job.total_tasks, max_attempts
        );
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.store.get_job(job_id).await
    }

    /// DONE tasks of the job, in claim order.
    pub async fn results(&self, job_id: &str) -> Result<Vec<Task>> {
        self.store
            .list_job_tasks(job_id, Some(TaskStatus::Done))
            .await
    }

    /// Cancels every NEW task of a non-terminal job. RUNNING tasks are left
    /// to finish or be reaped.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome> {
        let outcome = self.store.cancel_job(job_id, self.clock.now()).await?;
        if let CancelOutcome::Cancelled {
            job,
            cancelled_tasks,
        } = &outcome
        {
            info!(
                "job {} cancelled, {} pending tasks dropped",
                job.id, cancelled_tasks
            );
        }
        Ok(outcome)
    }
}
