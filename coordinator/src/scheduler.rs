//! Task claiming and idempotent result reporting.
//!
//! Reports are checked against a fresh snapshot and applied with a
//! conditional transition guarded by that snapshot. If the row moved in
//! between (a reaper reset, a concurrent duplicate report) the guard misses
//! and the report is judged again against the new state.

use std::sync::Arc;

use common::{TaskStatus, MAX_CLAIM_BATCH};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::aggregator::log_progress;
use crate::clock::Clock;
use crate::error::{CoordinatorError, Result};
use crate::model::{
    CompleteOutcome, FailOutcome, Task, TaskReport, TaskTransition, Transitioned,
};
use crate::store::Store;

/// Hard ceiling on tasks per claim, whatever the caller asks for.
pub const MAX_CLAIM: usize = MAX_CLAIM_BATCH as usize;

const MAX_GUARD_RETRIES: usize = 8;

#[derive(Clone)]
pub struct TaskScheduler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

/// What to do with a failure report given the task's current state.
#[derive(Debug, PartialEq)]
enum FailureStep {
    Reply(FailOutcome),
    Apply(TaskTransition, FailOutcome),
}

fn completion_verdict(task: &Task, spot_id: &str) -> Option<CompleteOutcome> {
    if matches!(task.status, TaskStatus::Done | TaskStatus::Failed) {
        return Some(CompleteOutcome::AlreadyDone);
    }
    if task.assigned_to.as_deref().is_some_and(|owner| owner != spot_id) {
        return Some(CompleteOutcome::WrongSpot);
    }
    if task.status != TaskStatus::Running {
        // late report after a reset; accept it quietly
        return Some(CompleteOutcome::AlreadyDone);
    }
    None
}

fn failure_verdict(task: &Task, spot_id: &str, error: &str, retriable: bool) -> FailureStep {
    if task.status.is_terminal() {
        return FailureStep::Reply(FailOutcome::AlreadyTerminal);
    }
    if task.assigned_to.as_deref().is_some_and(|owner| owner != spot_id) {
        return FailureStep::Reply(FailOutcome::WrongSpot);
    }
    if task.status != TaskStatus::Running {
        return FailureStep::Reply(FailOutcome::AlreadyTerminal);
    }
    if retriable && task.can_retry() {
        FailureStep::Apply(TaskTransition::Requeue, FailOutcome::Retried)
    } else {
        FailureStep::Apply(
            TaskTransition::Fail {
                error: error.to_string(),
            },
            FailOutcome::Failed,
        )
    }
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Queues a task that belongs to no job.
    pub async fn submit(&self, payload: Value, priority: i32, max_attempts: i32) -> Result<Task> {
        let task = Task::new(None, payload, priority, max_attempts, self.clock.now())?;
        self.store.insert_task(&task).await?;
        info!(
            "ad-hoc task {} queued (priority {}, max_attempts {})",
            task.id, priority, max_attempts
        );
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get_task(task_id).await
    }

    /// Leases up to `max_tasks` (clamped to [`MAX_CLAIM`]) NEW tasks to `spot_id`.
    ///
    /// Only UP spots get work; anything else gets an empty lease until its
    /// next heartbeat.
    pub async fn claim(&self, spot_id: &str, max_tasks: usize) -> Result<Vec<Task>> {
        let limit = max_tasks.min(MAX_CLAIM);
        if limit == 0 {
            return Ok(Vec::new());
        }
        let Some(tasks) = self
            .store
            .claim_tasks(spot_id, limit, self.clock.now())
            .await?
        else {
            warn!("spot {} is unknown or not UP, claim refused", spot_id);
            return Ok(Vec::new());
        };
        if tasks.is_empty() {
            debug!("spot {} asked for {} tasks, none available", spot_id, limit);
        } else {
            for t in &tasks {
                info!(
                    "task {} claimed by spot {} (attempt {}/{})",
                    t.id, spot_id, t.attempts, t.max_attempts
                );
            }
        }
        Ok(tasks)
    }

    pub async fn complete_idempotent(
        &self,
        task_id: &str,
        spot_id: &str,
        report: TaskReport,
    ) -> Result<CompleteOutcome> {
        let transition = TaskTransition::Complete(report);
        for _ in 0..MAX_GUARD_RETRIES {
            let Some(task) = self.store.get_task(task_id).await? else {
                return Ok(CompleteOutcome::NotFound);
            };
            if let Some(outcome) = completion_verdict(&task, spot_id) {
                match outcome {
                    CompleteOutcome::WrongSpot => warn!(
                        "spot {} reported completion of task {} owned by {:?}",
                        spot_id, task_id, task.assigned_to
                    ),
                    _ => debug!(
                        "duplicate completion of task {} from spot {} ({})",
                        task_id, spot_id, task.status
                    ),
                }
                return Ok(outcome);
            }

            let applied = self
                .store
                .transition_task(task_id, &task.guard(), &transition, self.clock.now())
                .await?;
            if let Some(done) = applied {
                info!("task {} completed by spot {}", task_id, spot_id);
                if let Some(update) = &done.job {
                    log_progress(update);
                }
                return Ok(CompleteOutcome::Completed);
            }
            debug!("task {} changed under completion, re-reading", task_id);
        }
        Err(CoordinatorError::Conflict(format!(
            "task {task_id} kept changing while recording completion"
        )))
    }

    pub async fn fail_idempotent(
        &self,
        task_id: &str,
        spot_id: &str,
        error: &str,
        retriable: bool,
    ) -> Result<FailOutcome> {
        for _ in 0..MAX_GUARD_RETRIES {
            let Some(task) = self.store.get_task(task_id).await? else {
                return Ok(FailOutcome::NotFound);
            };
            let (transition, outcome) = match failure_verdict(&task, spot_id, error, retriable) {
                FailureStep::Reply(outcome) => {
                    if outcome == FailOutcome::WrongSpot {
                        warn!(
                            "spot {} reported failure of task {} owned by {:?}",
                            spot_id, task_id, task.assigned_to
                        );
                    }
                    return Ok(outcome);
                }
                FailureStep::Apply(transition, outcome) => (transition, outcome),
            };

            let applied = self
                .store
                .transition_task(task_id, &task.guard(), &transition, self.clock.now())
                .await?;
            let Some(Transitioned { task: updated, job }) = applied else {
                debug!("task {} changed under failure report, re-reading", task_id);
                continue;
            };

            match outcome {
                FailOutcome::Retried => info!(
                    "task {} failed on spot {}, requeued (attempt {}/{}): {}",
                    task_id, spot_id, updated.attempts, updated.max_attempts, error
                ),
                _ => {
                    warn!(
                        "task {} failed permanently on spot {} after {} attempts: {}",
                        task_id, spot_id, updated.attempts, error
                    );
                    if let Some(update) = &job {
                        log_progress(update);
                    }
                }
            }
            return Ok(outcome);
        }
        Err(CoordinatorError::Conflict(format!(
            "task {task_id} kept changing while recording failure"
        )))
    }
}
