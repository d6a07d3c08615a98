//! Store port: the single owner of all persisted state.
//!
//! Every method is one atomic operation. Implementations must serialise
//! concurrent callers per row: two overlapping `claim_tasks` calls never
//! return the same task, and a conditional transition either applies to the
//! row it guarded, together with its job counter, or does nothing.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{SpotStatus, TaskStatus};
use tracing::{info, warn};

use crate::error::{CoordinatorError, Result};
use crate::model::{
    CancelOutcome, Heartbeat, Job, Spot, Task, TaskCounts, TaskGuard, TaskTransition,
    Transitioned,
};

#[async_trait]
pub trait Store: Send + Sync {
    /* ---- jobs ---- */

    /// Persists a job and all of its tasks together.
    async fn insert_job(&self, job: &Job, tasks: &[Task]) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// Cancels a non-terminal job and every NEW task of it.
    async fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<CancelOutcome>;

    /* ---- tasks ---- */

    async fn insert_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Tasks of a job in claim order, optionally filtered by status.
    async fn list_job_tasks(&self, job_id: &str, status: Option<TaskStatus>)
        -> Result<Vec<Task>>;

    /// Leases up to `limit` NEW tasks to `spot_id`, highest priority first,
    /// oldest first among equals. Jobs of claimed tasks move to RUNNING.
    ///
    /// `None` when the spot is unknown or not UP; the spot row is checked
    /// in the same transaction as the lease.
    async fn claim_tasks(
        &self,
        spot_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Task>>>;

    /// Applies `transition` only if the row still matches `guard`. A
    /// terminal transition bumps the job's counter in the same step.
    /// `None` when the guard did not match.
    async fn transition_task(
        &self,
        task_id: &str,
        guard: &TaskGuard,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Transitioned>>;

    /// RUNNING tasks whose `started_at` is older than `cutoff`.
    async fn stuck_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;

    async fn count_tasks(&self) -> Result<TaskCounts>;

    /* ---- spots ---- */

    async fn insert_spot(&self, spot: &Spot) -> Result<()>;

    /// Creates the spot if unknown, otherwise refreshes it. Always UP.
    async fn upsert_heartbeat(&self, hb: &Heartbeat, now: DateTime<Utc>) -> Result<Spot>;

    async fn get_spot(&self, spot_id: &str) -> Result<Option<Spot>>;

    async fn list_spots(&self) -> Result<Vec<Spot>>;

    async fn count_spots(&self, status: SpotStatus) -> Result<i64>;

    /// Ids of UP spots last heard from before `cutoff`.
    async fn stale_spots(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>>;

    /// Marks the spot DOWN if it is still UP and silent since before
    /// `cutoff`, and recovers its RUNNING tasks (see
    /// [`TaskTransition::recover`]) in the same transaction. `None` when the
    /// spot no longer qualifies.
    async fn retire_spot(
        &self,
        spot_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>>;

    /// Deletes a spot and recovers its RUNNING tasks in one transaction.
    /// `None` if it did not exist.
    async fn delete_spot(&self, spot_id: &str, now: DateTime<Utc>)
        -> Result<Option<Vec<Transitioned>>>;
}

/// Opens the store named by `database_url`.
///
/// `memory` gives a process-local store; `postgres://` URLs connect a pool
/// and apply pending migrations.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<Arc<dyn Store>> {
    if database_url == "memory" {
        warn!("using in-memory store, state is lost on restart");
        return Ok(Arc::new(MemoryStore::new()));
    }
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let store = PgStore::connect(database_url, max_connections).await?;
        store.migrate().await?;
        info!("connected to postgres store");
        return Ok(Arc::new(store));
    }
    Err(CoordinatorError::Validation(format!(
        "unsupported database url `{database_url}`, expected `memory` or a postgres:// url"
    )))
}
