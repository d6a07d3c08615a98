use std::sync::Arc;

use chrono::Duration;
use common::{SpotStatus, TaskStatus};
use tracing::{debug, info, warn};

use crate::aggregator::log_progress;
use crate::clock::Clock;
use crate::error::{CoordinatorError, Result};
use crate::model::{Heartbeat, Spot, Transitioned};
use crate::store::Store;

/// Registers spots, records their heartbeats and retires the silent ones.
#[derive(Clone)]
pub struct SpotTracker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    heartbeat_timeout: Duration,
}

fn validate(hb: &Heartbeat) -> Result<()> {
    if hb.spot_id.trim().is_empty() {
        return Err(CoordinatorError::Validation("spotId is required".into()));
    }
    if !(0.0..=100.0).contains(&hb.cpu_load) {
        return Err(CoordinatorError::Validation(format!(
            "cpuLoad must be within 0-100, got {}",
            hb.cpu_load
        )));
    }
    if hb.running_tasks < 0 {
        return Err(CoordinatorError::Validation(format!(
            "runningTasks must not be negative, got {}",
            hb.running_tasks
        )));
    }
    if hb.total_cores <= 0 {
        return Err(CoordinatorError::Validation(format!(
            "totalCores must be positive, got {}",
            hb.total_cores
        )));
    }
    Ok(())
}

impl SpotTracker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, heartbeat_timeout: Duration) -> Self {
        Self {
            store,
            clock,
            heartbeat_timeout,
        }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    pub async fn register_spot(&self, ip_address: &str) -> Result<Spot> {
        let spot = Spot::register(ip_address, self.clock.now());
        self.store.insert_spot(&spot).await?;
        info!("spot {} registered from {}", spot.id, spot.ip_address);
        Ok(spot)
    }

    /// Upserts the spot; unknown ids are registered on the fly.
    pub async fn heartbeat(&self, hb: Heartbeat) -> Result<Spot> {
        validate(&hb)?;
        let spot = self.store.upsert_heartbeat(&hb, self.clock.now()).await?;
        debug!(
            "heartbeat from spot {}: cpu={:.1}% running={} cores={}",
            spot.id, spot.cpu_load, spot.running_tasks, spot.total_cores
        );
        Ok(spot)
    }

    /// Marks spots silent for longer than the heartbeat timeout as DOWN and
    /// recovers their RUNNING tasks, one spot per store transaction.
    /// Returns how many spots went DOWN.
    pub async fn reap_stale_spots(&self) -> Result<usize> {
        let cutoff = self.clock.now() - self.heartbeat_timeout;
        let stale = self.store.stale_spots(cutoff).await?;

        let mut down = 0;
        for spot_id in &stale {
            match self.store.retire_spot(spot_id, cutoff, self.clock.now()).await {
                Ok(Some(recovered)) => {
                    down += 1;
                    warn!(
                        "spot {} marked DOWN (no heartbeat since before {}), {} tasks recovered",
                        spot_id,
                        cutoff,
                        recovered.len()
                    );
                    log_recovered(&recovered);
                }
                Ok(None) => debug!("spot {} came back before it could be retired", spot_id),
                // still UP, so the next sweep picks it up again
                Err(e) => warn!("retiring spot {} failed: {}", spot_id, e),
            }
        }
        Ok(down)
    }

    pub async fn list_spots(&self) -> Result<Vec<Spot>> {
        self.store.list_spots().await
    }

    pub async fn active_spots(&self) -> Result<i64> {
        self.store.count_spots(SpotStatus::Up).await
    }

    /// Removes a spot and recovers its RUNNING tasks.
    pub async fn delete_spot(&self, spot_id: &str) -> Result<bool> {
        let Some(recovered) = self.store.delete_spot(spot_id, self.clock.now()).await? else {
            return Ok(false);
        };
        info!("spot {} deleted, {} tasks recovered", spot_id, recovered.len());
        log_recovered(&recovered);
        Ok(true)
    }
}

fn log_recovered(recovered: &[Transitioned]) {
    for t in recovered {
        match t.task.status {
            TaskStatus::Failed => warn!(
                "task {} failed: {}",
                t.task.id,
                t.task.error_message.as_deref().unwrap_or("-")
            ),
            _ => debug!("task {} requeued", t.task.id),
        }
        if let Some(update) = &t.job {
            log_progress(update);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn hb(spot_id: &str) -> Heartbeat {
        Heartbeat {
            spot_id: spot_id.into(),
            ip_address: "10.0.0.7".into(),
            cpu_load: 12.5,
            running_tasks: 1,
            total_cores: 4,
        }
    }

    fn tracker() -> (SpotTracker, Arc<ManualClock>, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let tracker = SpotTracker::new(store.clone(), clock.clone(), Duration::seconds(30));
        (tracker, clock, store)
    }

    #[tokio::test]
    async fn heartbeat_registers_unknown_spot() {
        let (tracker, _, store) = tracker();
        let spot = tracker.heartbeat(hb("spot-x")).await.unwrap();
        assert_eq!(spot.id, "spot-x");
        assert_eq!(spot.status, SpotStatus::Up);
        assert_eq!(store.list_spots().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_revives_down_spot() {
        let (tracker, clock, _) = tracker();
        let spot = tracker.register_spot("10.0.0.7").await.unwrap();
        clock.advance(Duration::seconds(31));
        assert_eq!(tracker.reap_stale_spots().await.unwrap(), 1);

        let revived = tracker.heartbeat(hb(&spot.id)).await.unwrap();
        assert_eq!(revived.status, SpotStatus::Up);
        assert_eq!(revived.registered_at, spot.registered_at);
        assert_eq!(revived.total_cores, 4);
    }

    #[tokio::test]
    async fn fresh_spots_survive_the_sweep() {
        let (tracker, clock, _) = tracker();
        tracker.register_spot("10.0.0.1").await.unwrap();
        clock.advance(Duration::seconds(29));
        assert_eq!(tracker.reap_stale_spots().await.unwrap(), 0);
        assert_eq!(tracker.active_spots().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_spot_loses_its_last_attempt_task() {
        let (tracker, clock, store) = tracker();
        let jobs = crate::aggregator::JobAggregator::new(store.clone(), clock.clone());
        let job = jobs
            .create_job("opt.jar", serde_json::json!({}), vec![serde_json::json!(1)], 1)
            .await
            .unwrap();

        // every round the task takes down the spot holding it
        let first = tracker.register_spot("10.0.0.1").await.unwrap();
        let claimed = store
            .claim_tasks(&first.id, 1, clock.now())
            .await
            .unwrap()
            .unwrap();
        clock.advance(Duration::seconds(31));
        assert_eq!(tracker.reap_stale_spots().await.unwrap(), 1);

        let task = store.get_task(&claimed[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        let job = store.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(job.status, common::JobStatus::Failed);
        assert_eq!(job.failed_tasks, 1);

        let second = tracker.register_spot("10.0.0.2").await.unwrap();
        assert!(store
            .claim_tasks(&second.id, 1, clock.now())
            .await
            .unwrap()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn down_spot_cannot_claim_until_it_heartbeats() {
        let (tracker, clock, store) = tracker();
        let spot = tracker.register_spot("10.0.0.7").await.unwrap();
        let task = crate::model::Task::new(None, serde_json::json!(1), 0, 3, clock.now()).unwrap();
        store.insert_task(&task).await.unwrap();

        clock.advance(Duration::seconds(31));
        tracker.reap_stale_spots().await.unwrap();
        assert!(store
            .claim_tasks(&spot.id, 1, clock.now())
            .await
            .unwrap()
            .is_none());
        // a second sweep has nothing left to free
        assert_eq!(tracker.reap_stale_spots().await.unwrap(), 0);
        assert_eq!(store.count_tasks().await.unwrap().new, 1);

        tracker.heartbeat(hb(&spot.id)).await.unwrap();
        let claimed = store
            .claim_tasks(&spot.id, 1, clock.now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    #[tokio::test]
    async fn invalid_heartbeats_are_rejected() {
        let (tracker, _, _) = tracker();
        for bad in [
            Heartbeat {
                cpu_load: 100.5,
                ..hb("s")
            },
            Heartbeat {
                running_tasks: -1,
                ..hb("s")
            },
            Heartbeat {
                total_cores: 0,
                ..hb("s")
            },
            hb(" "),
        ] {
            assert!(matches!(
                tracker.heartbeat(bad).await,
                Err(CoordinatorError::Validation(_))
            ));
        }
    }
}
