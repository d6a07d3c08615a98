//! In-process store.
//!
//! All three tables sit behind one async mutex; each operation takes the
//! lock once, which gives it the isolation of a transaction.

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobStatus, SpotStatus, TaskStatus};
use tokio::sync::Mutex;

use super::Store;
use crate::error::{CoordinatorError, Result};
use crate::model::{
    CancelOutcome, CounterUpdate, Heartbeat, Job, Spot, Task, TaskCounts, TaskGuard,
    TaskTransition, Transitioned,
};

/// Task plus its insertion order, the final claim tie-break.
struct TaskRow {
    seq: u64,
    task: Task,
}

#[derive(Default)]
struct Tables {
    jobs: HashMap<String, Job>,
    tasks: HashMap<String, TaskRow>,
    spots: HashMap<String, Spot>,
    next_seq: u64,
}

impl Tables {
    fn push_task(&mut self, task: &Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(CoordinatorError::Conflict(format!(
                "task {} already exists",
                task.id
            )));
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks.insert(
            task.id.clone(),
            TaskRow {
                seq,
                task: task.clone(),
            },
        );
        Ok(())
    }

    /// Task rows sorted in claim order.
    fn ordered<'a>(&'a self, filter: impl Fn(&Task) -> bool) -> Vec<&'a TaskRow> {
        let mut rows: Vec<&TaskRow> = self.tasks.values().filter(|r| filter(&r.task)).collect();
        rows.sort_by_key(|r| (Reverse(r.task.priority), r.task.created_at, r.seq));
        rows
    }

    /// Applies `transition` and bumps the job counter a terminal
    /// transition calls for.
    fn settle(
        &mut self,
        task_id: &str,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Option<Transitioned> {
        let row = self.tasks.get_mut(task_id)?;
        row.task.apply(transition, now);
        let task = row.task.clone();

        let job = match (transition.job_counter(), &task.job_id) {
            (Some(counter), Some(job_id)) => self.jobs.get_mut(job_id).map(|job| {
                let settled = job.record_outcome(counter, now);
                CounterUpdate {
                    job: job.clone(),
                    settled,
                }
            }),
            _ => None,
        };
        Some(Transitioned { task, job })
    }

    fn recover_spot_tasks(
        &mut self,
        spot_id: &str,
        cause: &str,
        now: DateTime<Utc>,
    ) -> Vec<Transitioned> {
        let owned: Vec<(String, TaskTransition)> = self
            .ordered(|task| {
                task.status == TaskStatus::Running && task.assigned_to.as_deref() == Some(spot_id)
            })
            .into_iter()
            .map(|r| (r.task.id.clone(), TaskTransition::recover(&r.task, cause)))
            .collect();
        owned
            .into_iter()
            .filter_map(|(id, transition)| self.settle(&id, &transition, now))
            .collect()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_job(&self, job: &Job, tasks: &[Task]) -> Result<()> {
        let mut t = self.tables.lock().await;
        if t.jobs.contains_key(&job.id) {
            return Err(CoordinatorError::Conflict(format!(
                "job {} already exists",
                job.id
            )));
        }
        if let Some(dup) = tasks.iter().find(|task| t.tasks.contains_key(&task.id)) {
            return Err(CoordinatorError::Conflict(format!(
                "task {} already exists",
                dup.id
            )));
        }
        t.jobs.insert(job.id.clone(), job.clone());
        for task in tasks {
            t.push_task(task)?;
        }
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        Ok(self.tables.lock().await.jobs.get(job_id).cloned())
    }

    async fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut t = self.tables.lock().await;
        let status = match t.jobs.get(job_id) {
            None => return Ok(CancelOutcome::NotFound),
            Some(job) => job.status,
        };
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }

        let mut cancelled_tasks = 0;
        for row in t.tasks.values_mut() {
            if row.task.job_id.as_deref() == Some(job_id) && row.task.status == TaskStatus::New {
                row.task.status = TaskStatus::Cancelled;
                row.task.finished_at = Some(now);
                cancelled_tasks += 1;
            }
        }

        let job = t
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| CoordinatorError::Internal(format!("job {job_id} vanished")))?;
        job.status = JobStatus::Cancelled;
        job.finished_at = Some(now);
        Ok(CancelOutcome::Cancelled {
            job: job.clone(),
            cancelled_tasks,
        })
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.tables.lock().await.push_task(task)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        Ok(self
            .tables
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|r| r.task.clone()))
    }

    async fn list_job_tasks(
        &self,
        job_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let t = self.tables.lock().await;
        Ok(t
            .ordered(|task| {
                task.job_id.as_deref() == Some(job_id) && status.map_or(true, |s| task.status == s)
            })
            .into_iter()
            .map(|r| r.task.clone())
            .collect())
    }

    async fn claim_tasks(
        &self,
        spot_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Task>>> {
        let mut t = self.tables.lock().await;
        if !t
            .spots
            .get(spot_id)
            .is_some_and(|s| s.status == SpotStatus::Up)
        {
            return Ok(None);
        }
        let picked: Vec<String> = t
            .ordered(|task| task.status == TaskStatus::New)
            .into_iter()
            .take(limit)
            .map(|r| r.task.id.clone())
            .collect();

        let mut claimed = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(row) = t.tasks.get_mut(&id) {
                row.task.claim(spot_id, now);
                claimed.push(row.task.clone());
            }
        }
        for task in &claimed {
            if let Some(job_id) = &task.job_id {
                if let Some(job) = t.jobs.get_mut(job_id) {
                    job.mark_started(now);
                }
            }
        }
        Ok(Some(claimed))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        guard: &TaskGuard,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Transitioned>> {
        let mut t = self.tables.lock().await;
        if !t.tasks.get(task_id).is_some_and(|r| r.task.matches(guard)) {
            return Ok(None);
        }
        Ok(t.settle(task_id, transition, now))
    }

    async fn stuck_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let t = self.tables.lock().await;
        Ok(t
            .ordered(|task| {
                task.status == TaskStatus::Running
                    && task.started_at.map_or(false, |at| at < cutoff)
            })
            .into_iter()
            .map(|r| r.task.clone())
            .collect())
    }

    async fn count_tasks(&self) -> Result<TaskCounts> {
        let t = self.tables.lock().await;
        let mut counts = TaskCounts::default();
        for row in t.tasks.values() {
            counts.add(row.task.status, 1);
        }
        Ok(counts)
    }

    async fn insert_spot(&self, spot: &Spot) -> Result<()> {
        let mut t = self.tables.lock().await;
        if t.spots.contains_key(&spot.id) {
            return Err(CoordinatorError::Conflict(format!(
                "spot {} already exists",
                spot.id
            )));
        }
        t.spots.insert(spot.id.clone(), spot.clone());
        Ok(())
    }

    async fn upsert_heartbeat(&self, hb: &Heartbeat, now: DateTime<Utc>) -> Result<Spot> {
        let mut t = self.tables.lock().await;
        let spot = t
            .spots
            .entry(hb.spot_id.clone())
            .and_modify(|s| s.apply_heartbeat(hb, now))
            .or_insert_with(|| Spot::from_heartbeat(hb, now));
        Ok(spot.clone())
    }

    async fn get_spot(&self, spot_id: &str) -> Result<Option<Spot>> {
        Ok(self.tables.lock().await.spots.get(spot_id).cloned())
    }

    async fn list_spots(&self) -> Result<Vec<Spot>> {
        let t = self.tables.lock().await;
        let mut spots: Vec<Spot> = t.spots.values().cloned().collect();
        spots.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        Ok(spots)
    }

    async fn count_spots(&self, status: SpotStatus) -> Result<i64> {
        let t = self.tables.lock().await;
        Ok(t.spots.values().filter(|s| s.status == status).count() as i64)
    }

    async fn stale_spots(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let t = self.tables.lock().await;
        let mut stale: Vec<String> = t
            .spots
            .values()
            .filter(|s| s.status == SpotStatus::Up && s.last_heartbeat < cutoff)
            .map(|s| s.id.clone())
            .collect();
        stale.sort();
        Ok(stale)
    }

    async fn retire_spot(
        &self,
        spot_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        let mut t = self.tables.lock().await;
        match t.spots.get_mut(spot_id) {
            Some(spot) if spot.status == SpotStatus::Up && spot.last_heartbeat < cutoff => {
                spot.status = SpotStatus::Down;
            }
            _ => return Ok(None),
        }
        let cause = format!("spot {spot_id} went DOWN");
        Ok(Some(t.recover_spot_tasks(spot_id, &cause, now)))
    }

    async fn delete_spot(
        &self,
        spot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        let mut t = self.tables.lock().await;
        if t.spots.remove(spot_id).is_none() {
            return Ok(None);
        }
        let cause = format!("spot {spot_id} was deleted");
        Ok(Some(t.recover_spot_tasks(spot_id, &cause, now)))
    }
}
