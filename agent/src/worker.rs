use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common::{
    ClaimedTask, CompleteTaskRequest, FailTaskRequest, HeartbeatRequest, MAX_CLAIM_BATCH,
};
use sysinfo::{CpuExt, System, SystemExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::client::{CoordinatorClient, ReportAck};
use crate::config::AgentConfig;
use crate::executor::run_payload;

const REPORT_ATTEMPTS: u32 = 3;

/// Main agent loop:
/// - registers with the coordinator
/// - heartbeats on its own timer
/// - claims as many tasks as it has free slots
/// - runs each task and reports the outcome
pub async fn run(cfg: AgentConfig) -> Result<()> {
    let client = CoordinatorClient::new(&cfg.coordinator_url, cfg.agent_key.clone());
    let host = hostname::get()
        .unwrap_or_default()
        .to_string_lossy()
        .to_string();

    let hello = client
        .hello()
        .await
        .with_context(|| format!("registering with {}", cfg.coordinator_url))?;
    let spot_id = hello.spot_id;
    info!(
        "agent on {} registered as spot {} (coordinator {}, parallelism {})",
        host, spot_id, hello.coordinator_version, cfg.max_parallel
    );

    let slots = Arc::new(Semaphore::new(cfg.max_parallel));
    let heartbeat = tokio::spawn(heartbeat_loop(
        client.clone(),
        spot_id.clone(),
        slots.clone(),
        cfg.max_parallel,
        cfg.heartbeat_interval(),
    ));

    tokio::select! {
        res = claim_loop(&cfg, &client, &spot_id, &slots) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, waiting for running tasks");
        }
    }

    heartbeat.abort();
    // every permit back means every spawned task has reported
    let _drained = slots
        .acquire_many(cfg.max_parallel as u32)
        .await
        .context("waiting for running tasks")?;
    info!("agent {} stopped", spot_id);
    Ok(())
}

async fn claim_loop(
    cfg: &AgentConfig,
    client: &CoordinatorClient,
    spot_id: &str,
    slots: &Arc<Semaphore>,
) -> Result<()> {
    loop {
        let free = slots.available_permits();
        if free == 0 {
            sleep(cfg.poll_interval()).await;
            continue;
        }
        let want = free.min(MAX_CLAIM_BATCH as usize) as i32;
        let tasks = match client.claim(spot_id, want).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("claim failed: {:#}", e);
                sleep(cfg.poll_interval()).await;
                continue;
            }
        };
        if tasks.is_empty() {
            debug!("no tasks available, sleeping");
            sleep(cfg.poll_interval()).await;
            continue;
        }

        for task in tasks {
            let permit = slots.clone().acquire_owned().await?;
            tokio::spawn(execute_and_report(
                client.clone(),
                spot_id.to_string(),
                cfg.exec.clone(),
                task,
                permit,
            ));
        }
    }
}

async fn heartbeat_loop(
    client: CoordinatorClient,
    spot_id: String,
    slots: Arc<Semaphore>,
    max_parallel: usize,
    every: Duration,
) {
    let mut sys = System::new();
    sys.refresh_cpu();
    let mut ticker = tokio::time::interval(every);

    loop {
        ticker.tick().await;
        sys.refresh_cpu();

        let cpu_load = f64::from(sys.global_cpu_info().cpu_usage()).clamp(0.0, 100.0);
        let total_cores = i32::try_from(sys.cpus().len()).unwrap_or(i32::MAX).max(1);
        let running = max_parallel.saturating_sub(slots.available_permits());

        let req = HeartbeatRequest {
            spot_id: spot_id.clone(),
            cpu_load,
            running_tasks: i32::try_from(running).unwrap_or(i32::MAX),
            total_cores,
        };
        match client.heartbeat(&req).await {
            Ok(()) => debug!(
                "heartbeat sent: cpu={:.1}% running={} cores={}",
                cpu_load, running, total_cores
            ),
            Err(e) => warn!("heartbeat failed: {:#}", e),
        }
    }
}

async fn execute_and_report(
    client: CoordinatorClient,
    spot_id: String,
    exec: String,
    task: ClaimedTask,
    _permit: OwnedSemaphorePermit,
) {
    info!("running task {}", task.task_id);

    let ack = match run_payload(&exec, &task.payload).await {
        Ok(done) => {
            info!("task {} finished in {} ms", task.task_id, done.runtime_ms);
            let req = CompleteTaskRequest {
                spot_id,
                runtime_ms: done.runtime_ms,
                iter: done.iter,
                fopt: done.fopt,
                result: done.result,
            };
            with_retries(|| client.complete(&task.task_id, &req)).await
        }
        Err(error) => {
            warn!("task {} failed: {}", task.task_id, error);
            let req = FailTaskRequest {
                spot_id,
                error,
                retriable: true,
            };
            with_retries(|| client.fail(&task.task_id, &req)).await
        }
    };

    match ack {
        Ok(ReportAck::Accepted { will_retry: true }) => {
            info!("task {} will be retried by the coordinator", task.task_id)
        }
        Ok(ReportAck::Accepted { will_retry: false }) => {
            debug!("report for task {} accepted", task.task_id)
        }
        Ok(ReportAck::Rejected(reason)) => {
            warn!("report for task {} dropped: {}", task.task_id, reason)
        }
        Err(e) => warn!("could not report task {}: {:#}", task.task_id, e),
    }
}

/// Reports are idempotent on the coordinator side, so resending after a
/// transport error is safe.
async fn with_retries<F, Fut>(mut report: F) -> Result<ReportAck>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<ReportAck>>,
{
    let mut attempt = 1;
    loop {
        match report().await {
            Ok(ack) => return Ok(ack),
            Err(e) if attempt < REPORT_ATTEMPTS => {
                warn!("report attempt {} failed: {:#}", attempt, e);
                sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
