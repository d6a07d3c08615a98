use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobStatus, SpotStatus, TaskStatus};
use sqlx::{postgres::PgPoolOptions, PgConnection, PgPool, Postgres, QueryBuilder};

use super::Store;
use crate::error::{CoordinatorError, Result};
use crate::model::{
    CancelOutcome, CounterUpdate, Heartbeat, Job, JobCounter, Spot, Task, TaskCounts, TaskGuard,
    TaskTransition, Transitioned,
};

const DB_CONNECT_TIMEOUT: Duration = Duration::from_millis(750);

// 8 bound columns per task keeps a chunk well under the 65535 bind limit.
const INSERT_CHUNK: usize = 4_000;

const TASK_GUARD: &str = "WHERE id = $1 AND status = $2 AND assigned_to IS NOT DISTINCT FROM $3 AND attempts = $4 RETURNING *";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(db_url: &str, max_connections: u32) -> Result<PgStore> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(DB_CONNECT_TIMEOUT)
            .connect(db_url)
            .await?;
        Ok(PgStore { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/* ---------------- row mapping ---------------- */

fn corrupt(e: common::UnknownStatus) -> CoordinatorError {
    CoordinatorError::Internal(format!("corrupt row: {e}"))
}

fn conflict_or_storage(e: sqlx::Error, what: String) -> CoordinatorError {
    let unique_violation = e
        .as_database_error()
        .and_then(|d| d.code())
        .map_or(false, |code| code == "23505");
    if unique_violation {
        CoordinatorError::Conflict(format!("{what} already exists"))
    } else {
        CoordinatorError::Storage(e)
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    artifact: String,
    config: serde_json::Value,
    status: String,
    total_tasks: i32,
    completed_tasks: i32,
    failed_tasks: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoordinatorError;

    fn try_from(r: JobRow) -> Result<Self> {
        Ok(Job {
            id: r.id,
            artifact: r.artifact,
            config: r.config,
            status: r.status.parse().map_err(corrupt)?,
            total_tasks: r.total_tasks,
            completed_tasks: r.completed_tasks,
            failed_tasks: r.failed_tasks,
            created_at: r.created_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    job_id: Option<String>,
    payload: serde_json::Value,
    status: String,
    assigned_to: Option<String>,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    runtime_ms: Option<i64>,
    iter: Option<i64>,
    fopt: Option<f64>,
    result: Option<String>,
}

impl TryFrom<TaskRow> for Task {
    type Error = CoordinatorError;

    fn try_from(r: TaskRow) -> Result<Self> {
        Ok(Task {
            id: r.id,
            job_id: r.job_id,
            payload: r.payload,
            status: r.status.parse().map_err(corrupt)?,
            assigned_to: r.assigned_to,
            priority: r.priority,
            attempts: r.attempts,
            max_attempts: r.max_attempts,
            error_message: r.error_message,
            created_at: r.created_at,
            started_at: r.started_at,
            finished_at: r.finished_at,
            runtime_ms: r.runtime_ms,
            iter: r.iter,
            fopt: r.fopt,
            result: r.result,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SpotRow {
    id: String,
    ip_address: String,
    cpu_load: f64,
    running_tasks: i32,
    total_cores: i32,
    status: String,
    last_heartbeat: DateTime<Utc>,
    registered_at: DateTime<Utc>,
}

impl TryFrom<SpotRow> for Spot {
    type Error = CoordinatorError;

    fn try_from(r: SpotRow) -> Result<Self> {
        Ok(Spot {
            id: r.id,
            ip_address: r.ip_address,
            cpu_load: r.cpu_load,
            running_tasks: r.running_tasks,
            total_cores: r.total_cores,
            status: r.status.parse().map_err(corrupt)?,
            last_heartbeat: r.last_heartbeat,
            registered_at: r.registered_at,
        })
    }
}

fn tasks_from(rows: Vec<TaskRow>) -> Result<Vec<Task>> {
    rows.into_iter().map(Task::try_from).collect()
}

async fn insert_tasks(conn: &mut PgConnection, tasks: &[Task]) -> Result<()> {
    for chunk in tasks.chunks(INSERT_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO tasks ( id, job_id, payload, status, priority, attempts, max_attempts, created_at ) ",
        );
        qb.push_values(chunk, |mut b, t| {
            b.push_bind(&t.id)
                .push_bind(&t.job_id)
                .push_bind(&t.payload)
                .push_bind(t.status.as_str())
                .push_bind(t.priority)
                .push_bind(t.attempts)
                .push_bind(t.max_attempts)
                .push_bind(t.created_at);
        });
        qb.build()
            .execute(&mut *conn)
            .await
            .map_err(|e| conflict_or_storage(e, "task".into()))?;
    }
    Ok(())
}

/// The guarded UPDATE for one transition. `None` when the guard missed.
async fn apply_guarded(
    conn: &mut PgConnection,
    task_id: &str,
    guard: &TaskGuard,
    transition: &TaskTransition,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let row = match transition {
        TaskTransition::Complete(report) => {
            let sql = format!(
                "UPDATE tasks SET status = 'DONE', finished_at = $5, error_message = NULL, runtime_ms = $6, iter = $7, fopt = $8, result = $9 {TASK_GUARD}"
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(task_id)
                .bind(guard.status.as_str())
                .bind(&guard.assigned_to)
                .bind(guard.attempts)
                .bind(now)
                .bind(report.runtime_ms)
                .bind(report.iter)
                .bind(report.fopt)
                .bind(&report.result)
                .fetch_optional(&mut *conn)
                .await?
        }
        TaskTransition::Requeue => {
            let sql = format!(
                "UPDATE tasks SET status = 'NEW', assigned_to = NULL, started_at = NULL, error_message = NULL {TASK_GUARD}"
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(task_id)
                .bind(guard.status.as_str())
                .bind(&guard.assigned_to)
                .bind(guard.attempts)
                .fetch_optional(&mut *conn)
                .await?
        }
        TaskTransition::Fail { error } => {
            let sql = format!(
                "UPDATE tasks SET status = 'FAILED', finished_at = $5, error_message = $6 {TASK_GUARD}"
            );
            sqlx::query_as::<_, TaskRow>(&sql)
                .bind(task_id)
                .bind(guard.status.as_str())
                .bind(&guard.assigned_to)
                .bind(guard.attempts)
                .bind(now)
                .bind(error)
                .fetch_optional(&mut *conn)
                .await?
        }
    };
    row.map(Task::try_from).transpose()
}

/// Bumps one job counter under a row lock and settles the job when the
/// counters are complete.
async fn bump_job(
    conn: &mut PgConnection,
    job_id: &str,
    counter: JobCounter,
    now: DateTime<Utc>,
) -> Result<Option<CounterUpdate>> {
    let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
        .bind(job_id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut job = Job::try_from(row)?;
    let settled = job.record_outcome(counter, now);

    sqlx::query(
        "UPDATE jobs SET completed_tasks = $2, failed_tasks = $3, status = $4, finished_at = $5 WHERE id = $1",
    )
    .bind(&job.id)
    .bind(job.completed_tasks)
    .bind(job.failed_tasks)
    .bind(job.status.as_str())
    .bind(job.finished_at)
    .execute(&mut *conn)
    .await?;

    Ok(Some(CounterUpdate { job, settled }))
}

async fn settle(
    conn: &mut PgConnection,
    task: Task,
    transition: &TaskTransition,
    now: DateTime<Utc>,
) -> Result<Transitioned> {
    let job = match (transition.job_counter(), &task.job_id) {
        (Some(counter), Some(job_id)) => bump_job(conn, job_id, counter, now).await?,
        _ => None,
    };
    Ok(Transitioned { task, job })
}

/// Locks the spot's RUNNING tasks and recovers each one. The caller owns the
/// transaction and has already locked or removed the spot row.
async fn recover_spot_tasks(
    conn: &mut PgConnection,
    spot_id: &str,
    cause: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Transitioned>> {
    let rows = sqlx::query_as::<_, TaskRow>(
        "SELECT * FROM tasks WHERE assigned_to = $1 AND status = 'RUNNING' ORDER BY priority DESC, created_at ASC, id ASC FOR UPDATE",
    )
    .bind(spot_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut recovered = Vec::with_capacity(rows.len());
    for task in tasks_from(rows)? {
        let transition = TaskTransition::recover(&task, cause);
        if let Some(updated) = apply_guarded(conn, &task.id, &task.guard(), &transition, now).await? {
            recovered.push(settle(conn, updated, &transition, now).await?);
        }
    }
    Ok(recovered)
}

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, job: &Job, tasks: &[Task]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO jobs ( id, artifact, config, status, total_tasks, completed_tasks, failed_tasks, created_at ) VALUES ( $1, $2, $3, $4, $5, $6, $7, $8 )",
        )
        .bind(&job.id)
        .bind(&job.artifact)
        .bind(&job.config)
        .bind(job.status.as_str())
        .bind(job.total_tasks)
        .bind(job.completed_tasks)
        .bind(job.failed_tasks)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or_storage(e, format!("job {}", job.id)))?;

        insert_tasks(&mut *tx, tasks).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Job::try_from)
            .transpose()
    }

    async fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(CancelOutcome::NotFound);
        };
        let status: JobStatus = row.status.parse().map_err(corrupt)?;
        if status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal(status));
        }

        let cancelled_tasks = sqlx::query(
            "UPDATE tasks SET status = 'CANCELLED', finished_at = $2 WHERE job_id = $1 AND status = 'NEW'",
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let job = sqlx::query_as::<_, JobRow>(
            "UPDATE jobs SET status = 'CANCELLED', finished_at = $2 WHERE id = $1 RETURNING *",
        )
        .bind(job_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(CancelOutcome::Cancelled {
            job: Job::try_from(job)?,
            cancelled_tasks,
        })
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        insert_tasks(&mut *conn, std::slice::from_ref(task)).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        sqlx::query_as::<_, TaskRow>("SELECT * FROM tasks WHERE id = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Task::try_from)
            .transpose()
    }

    async fn list_job_tasks(
        &self,
        job_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE job_id = $1 AND ($2::TEXT IS NULL OR status = $2) ORDER BY priority DESC, created_at ASC, id ASC",
        )
        .bind(job_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await?;
        tasks_from(rows)
    }

    async fn claim_tasks(
        &self,
        spot_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Task>>> {
        let mut tx = self.pool.begin().await?;

        // FOR SHARE holds off a concurrent retire or delete of this spot
        // until the lease commits.
        let spot_status = sqlx::query_scalar::<_, String>(
            "SELECT status FROM spots WHERE id = $1 FOR SHARE",
        )
        .bind(spot_id)
        .fetch_optional(&mut *tx)
        .await?;
        if spot_status.as_deref() != Some(SpotStatus::Up.as_str()) {
            return Ok(None);
        }
        if limit == 0 {
            return Ok(Some(Vec::new()));
        }

        // SKIP LOCKED lets concurrent claimers pass over each other's rows
        // instead of queueing behind them.
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            WITH picked AS (
                SELECT id FROM tasks
                WHERE status = 'NEW'
                ORDER BY priority DESC, created_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET status = 'RUNNING', assigned_to = $1, started_at = $3, attempts = tasks.attempts + 1
            FROM picked
            WHERE tasks.id = picked.id
            RETURNING tasks.*
            "#,
        )
        .bind(spot_id)
        .bind(limit as i64)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;
        let mut claimed = tasks_from(rows)?;

        let mut job_ids: Vec<String> = claimed.iter().filter_map(|t| t.job_id.clone()).collect();
        job_ids.sort();
        job_ids.dedup();
        if !job_ids.is_empty() {
            sqlx::query(
                "UPDATE jobs SET status = 'RUNNING', started_at = COALESCE(started_at, $2) WHERE id = ANY($1) AND status = 'PENDING'",
            )
            .bind(&job_ids)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        claimed.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(Some(claimed))
    }

    async fn transition_task(
        &self,
        task_id: &str,
        guard: &TaskGuard,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Transitioned>> {
        let mut tx = self.pool.begin().await?;
        let Some(task) = apply_guarded(&mut *tx, task_id, guard, transition, now).await? else {
            return Ok(None);
        };
        let applied = settle(&mut *tx, task, transition, now).await?;
        tx.commit().await?;
        Ok(Some(applied))
    }

    async fn stuck_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        let rows = sqlx::query_as::<_, TaskRow>(
            "SELECT * FROM tasks WHERE status = 'RUNNING' AND started_at < $1 ORDER BY started_at ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        tasks_from(rows)
    }

    async fn count_tasks(&self) -> Result<TaskCounts> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM tasks GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            counts.add(status.parse().map_err(corrupt)?, n);
        }
        Ok(counts)
    }

    async fn insert_spot(&self, spot: &Spot) -> Result<()> {
        sqlx::query(
            "INSERT INTO spots ( id, ip_address, cpu_load, running_tasks, total_cores, status, last_heartbeat, registered_at ) VALUES ( $1, $2, $3, $4, $5, $6, $7, $8 )",
        )
        .bind(&spot.id)
        .bind(&spot.ip_address)
        .bind(spot.cpu_load)
        .bind(spot.running_tasks)
        .bind(spot.total_cores)
        .bind(spot.status.as_str())
        .bind(spot.last_heartbeat)
        .bind(spot.registered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_storage(e, format!("spot {}", spot.id)))?;
        Ok(())
    }

    async fn upsert_heartbeat(&self, hb: &Heartbeat, now: DateTime<Utc>) -> Result<Spot> {
        let row = sqlx::query_as::<_, SpotRow>(
            r#"
            INSERT INTO spots ( id, ip_address, cpu_load, running_tasks, total_cores, status, last_heartbeat, registered_at )
            VALUES ( $1, $2, $3, $4, $5, 'UP', $6, $6 )
            ON CONFLICT (id) DO UPDATE SET
                ip_address = EXCLUDED.ip_address,
                cpu_load = EXCLUDED.cpu_load,
                running_tasks = EXCLUDED.running_tasks,
                total_cores = EXCLUDED.total_cores,
                status = 'UP',
                last_heartbeat = EXCLUDED.last_heartbeat
            RETURNING *
            "#,
        )
        .bind(&hb.spot_id)
        .bind(&hb.ip_address)
        .bind(hb.cpu_load)
        .bind(hb.running_tasks)
        .bind(hb.total_cores)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Spot::try_from(row)
    }

    async fn get_spot(&self, spot_id: &str) -> Result<Option<Spot>> {
        sqlx::query_as::<_, SpotRow>("SELECT * FROM spots WHERE id = $1")
            .bind(spot_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Spot::try_from)
            .transpose()
    }

    async fn list_spots(&self) -> Result<Vec<Spot>> {
        sqlx::query_as::<_, SpotRow>("SELECT * FROM spots ORDER BY registered_at ASC, id ASC")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Spot::try_from)
            .collect()
    }

    async fn count_spots(&self, status: SpotStatus) -> Result<i64> {
        let n = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM spots WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn stale_spots(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM spots WHERE status = 'UP' AND last_heartbeat < $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn retire_spot(
        &self,
        spot_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        let mut tx = self.pool.begin().await?;

        let retired = sqlx::query_scalar::<_, String>(
            "UPDATE spots SET status = 'DOWN' WHERE id = $1 AND status = 'UP' AND last_heartbeat < $2 RETURNING id",
        )
        .bind(spot_id)
        .bind(cutoff)
        .fetch_optional(&mut *tx)
        .await?;
        if retired.is_none() {
            return Ok(None);
        }

        let cause = format!("spot {spot_id} went DOWN");
        let recovered = recover_spot_tasks(&mut *tx, spot_id, &cause, now).await?;
        tx.commit().await?;
        Ok(Some(recovered))
    }

    async fn delete_spot(
        &self,
        spot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query_scalar::<_, String>("DELETE FROM spots WHERE id = $1 RETURNING id")
            .bind(spot_id)
            .fetch_optional(&mut *tx)
            .await?;
        if deleted.is_none() {
            return Ok(None);
        }

        let cause = format!("spot {spot_id} was deleted");
        let recovered = recover_spot_tasks(&mut *tx, spot_id, &cause, now).await?;
        tx.commit().await?;
        Ok(Some(recovered))
    }
}
