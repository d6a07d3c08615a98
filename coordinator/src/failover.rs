use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::aggregator::log_progress;
use crate::clock::Clock;
use crate::error::Result;
use crate::model::{Task, TaskTransition};
use crate::store::Store;

/// Recovers tasks that stayed RUNNING longer than the stuck threshold,
/// whatever happened to the spot that held them.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    stuck_threshold: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, stuck_threshold: Duration) -> Self {
        Self {
            store,
            clock,
            stuck_threshold,
        }
    }

    /// One sweep. Returns how many tasks were requeued or failed.
    ///
    /// A task that fails to reap is logged and skipped; only the initial
    /// lookup can fail the whole sweep.
    pub async fn reap_stuck_tasks(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.stuck_threshold;
        let stuck = self.store.stuck_tasks(cutoff).await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        let mut reaped = 0;
        for task in &stuck {
            match self.reap_one(task).await {
                Ok(true) => reaped += 1,
                Ok(false) => debug!("task {} moved before it could be reaped", task.id),
                Err(e) => warn!("reaping task {} failed: {}", task.id, e),
            }
        }
        info!("reaper pass: {} of {} stuck tasks recovered", reaped, stuck.len());
        Ok(reaped)
    }

    async fn reap_one(&self, task: &Task) -> Result<bool> {
        let owner = task.assigned_to.as_deref().unwrap_or("-");
        let transition =
            TaskTransition::recover(task, &format!("stuck in RUNNING on spot {owner}"));

        let applied = self
            .store
            .transition_task(&task.id, &task.guard(), &transition, self.clock.now())
            .await?;
        let Some(updated) = applied else {
            return Ok(false);
        };

        match transition {
            TaskTransition::Requeue => warn!(
                "task {} stuck on spot {}, requeued (attempt {}/{})",
                task.id, owner, updated.task.attempts, updated.task.max_attempts
            ),
            _ => {
                warn!(
                    "task {} stuck on spot {} with no attempts left, marked FAILED",
                    task.id, owner
                );
                if let Some(update) = &updated.job {
                    log_progress(update);
                }
            }
        }
        Ok(true)
    }
}
