use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    ClaimRequest, CompleteTaskRequest, CreateJobRequest, HeartbeatRequest, JobStatus, SpotStatus,
    TaskStatus,
};
use serde_json::json;

use coordinator::clock::ManualClock;
use coordinator::model::{
    CancelOutcome, CompleteOutcome, Heartbeat, Job, Spot, Task, TaskCounts, TaskGuard,
    TaskTransition, Transitioned,
};
use coordinator::store::{MemoryStore, Store};
use coordinator::{Coordinator, CoordinatorError, CoordinatorSettings, Result};

/// Memory store whose `transition_task` errors for chosen tasks, the way a
/// dropped database connection would.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    /// Remaining failures per task id. `usize::MAX` fails forever.
    failures: Mutex<HashMap<String, usize>>,
}

impl FlakyStore {
    fn fail_transitions(&self, task_id: &str, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(task_id.to_string(), times);
    }

    fn should_fail(&self, task_id: &str) -> bool {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(task_id) {
            Some(0) | None => false,
            Some(left) => {
                if *left != usize::MAX {
                    *left -= 1;
                }
                true
            }
        }
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_job(&self, job: &Job, tasks: &[Task]) -> Result<()> {
        self.inner.insert_job(job, tasks).await
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        self.inner.get_job(job_id).await
    }

    async fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<CancelOutcome> {
        self.inner.cancel_job(job_id, now).await
    }

    async fn insert_task(&self, task: &Task) -> Result<()> {
        self.inner.insert_task(task).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.inner.get_task(task_id).await
    }

    async fn list_job_tasks(
        &self,
        job_id: &str,
        status: Option<TaskStatus>,
    ) -> Result<Vec<Task>> {
        self.inner.list_job_tasks(job_id, status).await
    }

    async fn claim_tasks(
        &self,
        spot_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Task>>> {
        self.inner.claim_tasks(spot_id, limit, now).await
    }

    async fn transition_task(
        &self,
        task_id: &str,
        guard: &TaskGuard,
        transition: &TaskTransition,
        now: DateTime<Utc>,
    ) -> Result<Option<Transitioned>> {
        if self.should_fail(task_id) {
            return Err(CoordinatorError::Storage(sqlx::Error::PoolTimedOut));
        }
        self.inner.transition_task(task_id, guard, transition, now).await
    }

    async fn stuck_tasks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        self.inner.stuck_tasks(cutoff).await
    }

    async fn count_tasks(&self) -> Result<TaskCounts> {
        self.inner.count_tasks().await
    }

    async fn insert_spot(&self, spot: &Spot) -> Result<()> {
        self.inner.insert_spot(spot).await
    }

    async fn upsert_heartbeat(&self, hb: &Heartbeat, now: DateTime<Utc>) -> Result<Spot> {
        self.inner.upsert_heartbeat(hb, now).await
    }

    async fn get_spot(&self, spot_id: &str) -> Result<Option<Spot>> {
        self.inner.get_spot(spot_id).await
    }

    async fn list_spots(&self) -> Result<Vec<Spot>> {
        self.inner.list_spots().await
    }

    async fn count_spots(&self, status: SpotStatus) -> Result<i64> {
        self.inner.count_spots(status).await
    }

    async fn stale_spots(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>> {
        self.inner.stale_spots(cutoff).await
    }

    async fn retire_spot(
        &self,
        spot_id: &str,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        self.inner.retire_spot(spot_id, cutoff, now).await
    }

    async fn delete_spot(
        &self,
        spot_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Vec<Transitioned>>> {
        self.inner.delete_spot(spot_id, now).await
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    clock: Arc<ManualClock>,
    coord: Coordinator,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(FlakyStore::default());
        let clock = Arc::new(ManualClock::default());
        let settings = CoordinatorSettings {
            max_attempts: 3,
            stuck_threshold: Duration::milliseconds(100),
            heartbeat_timeout: Duration::seconds(30),
        };
        let coord = Coordinator::new(store.clone(), clock.clone(), settings);
        Self {
            store,
            clock,
            coord,
        }
    }

    async fn job(&self, n: usize) -> String {
        self.coord
            .create_job(CreateJobRequest {
                artifact: "opt.jar".into(),
                payloads: Some((0..n).map(|i| json!(i)).collect()),
                ..Default::default()
            })
            .await
            .unwrap()
            .job_id
    }

    async fn claim(&self, spot_id: &str, n: i32) -> Vec<String> {
        self.coord
            .heartbeat(
                HeartbeatRequest {
                    spot_id: spot_id.into(),
                    cpu_load: 0.5,
                    running_tasks: 0,
                    total_cores: 2,
                },
                "10.0.0.7",
            )
            .await
            .unwrap();
        self.coord
            .claim(ClaimRequest {
                spot_id: spot_id.into(),
                max_tasks: n,
            })
            .await
            .unwrap()
            .tasks
            .into_iter()
            .map(|t| t.task_id)
            .collect()
    }

    async fn complete(&self, task_id: &str) -> Result<CompleteOutcome> {
        self.coord
            .complete(
                task_id,
                CompleteTaskRequest {
                    spot_id: "spot-a".into(),
                    runtime_ms: 12,
                    iter: Some(3),
                    fopt: Some(0.5),
                    result: None,
                },
            )
            .await
    }
}

#[tokio::test]
async fn failed_completion_leaves_task_and_job_untouched() {
    let h = Harness::new();
    let job_id = h.job(1).await;
    let ids = h.claim("spot-a", 1).await;
    h.store.fail_transitions(&ids[0], 1);

    let err = h.complete(&ids[0]).await.unwrap_err();
    assert!(matches!(err, CoordinatorError::Storage(_)));

    let task = h.coord.get_task(&ids[0]).await.unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    let job = h.coord.get_job(&job_id).await.unwrap();
    assert_eq!(job.completed_tasks, 0);
    assert_eq!(job.status, JobStatus::Running);

    // the agent retries the report
    assert_eq!(h.complete(&ids[0]).await.unwrap(), CompleteOutcome::Completed);
    let job = h.coord.get_job(&job_id).await.unwrap();
    assert_eq!(job.completed_tasks, 1);
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn reaper_skips_a_task_it_cannot_write() {
    let h = Harness::new();
    h.job(3).await;
    let ids = h.claim("spot-a", 3).await;
    assert_eq!(ids.len(), 3);
    h.store.fail_transitions(&ids[1], usize::MAX);
    h.clock.advance(Duration::milliseconds(150));

    assert_eq!(h.coord.reaper().reap_stuck_tasks().await.unwrap(), 2);

    for (i, id) in ids.iter().enumerate() {
        let task = h.coord.get_task(id).await.unwrap();
        let expected = if i == 1 {
            TaskStatus::Running
        } else {
            TaskStatus::New
        };
        assert_eq!(task.status, expected, "task {i}");
    }

    // the next sweep picks the stuck task up again once the store recovers
    h.store.fail_transitions(&ids[1], 0);
    assert_eq!(h.coord.reaper().reap_stuck_tasks().await.unwrap(), 1);
    assert_eq!(
        h.coord.get_task(&ids[1]).await.unwrap().status,
        TaskStatus::New
    );
}
