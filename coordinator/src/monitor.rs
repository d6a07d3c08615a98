//! Background sweeps. The reaper and the spot staleness check tick on
//! separate timers so a slow pass of one never delays the other.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::failover::Reaper;
use crate::tracker::SpotTracker;

pub async fn run_reaper_loop(reaper: Reaper, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = reaper.reap_stuck_tasks().await {
                    warn!("reaper sweep failed: {}", e);
                }
            }
        }
    }
    info!("reaper loop stopped");
}

pub async fn run_spot_monitor(tracker: SpotTracker, every: Duration, shutdown: CancellationToken) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                match tracker.reap_stale_spots().await {
                    Ok(0) => {}
                    Ok(n) => info!("{} stale spots marked DOWN", n),
                    Err(e) => warn!("spot staleness sweep failed: {}", e),
                }
            }
        }
    }
    info!("spot monitor stopped");
}

/// Spawns both sweeps on the current runtime.
pub fn spawn_sweeps(
    reaper: Reaper,
    reaper_every: Duration,
    tracker: SpotTracker,
    cleanup_every: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_reaper_loop(reaper, reaper_every, shutdown.clone())),
        tokio::spawn(run_spot_monitor(tracker, cleanup_every, shutdown)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::clock::SystemClock;
    use crate::store::{MemoryStore, Store};

    #[tokio::test]
    async fn sweeps_stop_on_shutdown() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let clock = Arc::new(SystemClock);
        let reaper = Reaper::new(store.clone(), clock.clone(), chrono::Duration::seconds(600));
        let tracker = SpotTracker::new(store, clock, chrono::Duration::seconds(90));

        let shutdown = CancellationToken::new();
        let handles = spawn_sweeps(
            reaper,
            Duration::from_millis(10),
            tracker,
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        for h in handles {
            tokio::time::timeout(Duration::from_secs(1), h)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
