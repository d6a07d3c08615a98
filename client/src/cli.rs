use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use common::{
    CancelJobResponse, CreateJobRequest, CreateJobResponse, ErrorBody, HealthResponse, JobInfo,
    JobResults, ParamRange, SpotList,
};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Command line client for the Orhestra coordinator")]
struct Cli {
    /// Coordinator base URL
    #[arg(long, env = "ORHESTRA_URL", default_value = "http://localhost:8081")]
    url: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submits a job, either from a payload file or a parameter grid
    Submit {
        #[arg(value_name = "ARTIFACT")]
        artifact: String,

        /// Main class or entry point passed along in every payload
        #[arg(long)]
        main_ref: Option<String>,

        /// Algorithm name; repeat for several
        #[arg(long = "alg")]
        algorithms: Vec<String>,

        /// Range as min:max[:step]
        #[arg(long, value_parser = parse_range)]
        iterations: Option<ParamRange>,

        #[arg(long, value_parser = parse_range)]
        agents: Option<ParamRange>,

        #[arg(long, value_parser = parse_range)]
        dimension: Option<ParamRange>,

        /// JSON file holding an array of payloads; overrides the grid
        #[arg(long)]
        payloads_file: Option<PathBuf>,

        #[arg(long)]
        max_attempts: Option<i32>,
    },
    /// Shows the state of a job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lists the results of a job's finished tasks
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Cancels a job's pending tasks
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lists known spots
    Spots,
    /// Coordinator health
    Health,
}

/// Parses `min:max` or `min:max:step`; a lone number is a single value.
fn parse_range(s: &str) -> Result<ParamRange, String> {
    let parts: Vec<&str> = s.split(':').collect();
    let num = |p: &str| {
        p.trim()
            .parse::<i64>()
            .map_err(|e| format!("`{p}` is not an integer: {e}"))
    };
    match parts.as_slice() {
        [v] => Ok(ParamRange::single(num(v)?)),
        [min, max] => Ok(ParamRange {
            min: num(min)?,
            max: num(max)?,
            step: 1,
        }),
        [min, max, step] => Ok(ParamRange {
            min: num(min)?,
            max: num(max)?,
            step: num(step)?,
        }),
        _ => Err(format!("`{s}` is not a range, expected min:max[:step]")),
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.context("decoding response");
    }
    match resp.json::<ErrorBody>().await {
        Ok(body) => bail!("{}: {}", status, body.error),
        Err(_) => bail!("request failed with {}", status),
    }
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.url.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            artifact,
            main_ref,
            algorithms,
            iterations,
            agents,
            dimension,
            payloads_file,
            max_attempts,
        } => {
            let payloads = match payloads_file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let list: Vec<serde_json::Value> = serde_json::from_str(&raw)
                        .with_context(|| format!("{} must hold a JSON array", path.display()))?;
                    Some(list)
                }
                None => None,
            };
            let req = CreateJobRequest {
                artifact,
                main_ref,
                algorithms,
                iterations,
                agents,
                dimension,
                payloads,
                config: None,
                max_attempts,
            };

            let resp = client
                .post(format!("{base_url}/api/v1/jobs"))
                .json(&req)
                .send()
                .await?;
            let created: CreateJobResponse = decode(resp).await?;
            println!("Job submitted:");
            println!("  id    : {}", created.job_id);
            println!("  tasks : {}", created.total_tasks);
        }

        Commands::Status { id } => {
            let resp = client
                .get(format!("{base_url}/api/v1/jobs/{id}"))
                .send()
                .await?;
            let job: JobInfo = decode(resp).await?;
            println!("Job {}", job.job_id);
            println!("  artifact : {}", job.artifact);
            println!("  status   : {}", job.status);
            println!(
                "  tasks    : total={}, completed={}, failed={}",
                job.total_tasks, job.completed_tasks, job.failed_tasks
            );
            if job.total_tasks > 0 {
                let done = job.completed_tasks + job.failed_tasks;
                let pct = f64::from(done) / f64::from(job.total_tasks) * 100.0;
                println!("  progress : {:.1}%", pct);
            }
            println!("  created  : {}", job.created_at);
            if let Some(started) = job.started_at {
                println!("  started  : {}", started);
            }
            if let Some(finished) = job.finished_at {
                println!("  finished : {}", finished);
            }
        }

        Commands::Results { id } => {
            let resp = client
                .get(format!("{base_url}/api/v1/jobs/{id}/results"))
                .send()
                .await?;
            let results: JobResults = decode(resp).await?;
            println!("Results for job {}:", results.job_id);
            if results.results.is_empty() {
                println!("  (no finished tasks yet)");
            }
            for r in results.results {
                println!(
                    "  {}  runtime={}ms iter={} fopt={} payload={}",
                    r.task_id,
                    r.runtime_ms.map_or("-".into(), |v| v.to_string()),
                    r.iter.map_or("-".into(), |v| v.to_string()),
                    r.fopt.map_or("-".into(), |v| v.to_string()),
                    r.payload
                );
                if let Some(result) = r.result {
                    println!("      result: {}", result);
                }
            }
        }

        Commands::Cancel { id } => {
            let resp = client
                .post(format!("{base_url}/api/v1/jobs/{id}/cancel"))
                .send()
                .await?;
            let cancelled: CancelJobResponse = decode(resp).await?;
            println!(
                "Job {} is {} ({} pending tasks cancelled)",
                cancelled.job_id, cancelled.status, cancelled.cancelled_tasks
            );
        }

        Commands::Spots => {
            let resp = client.get(format!("{base_url}/api/v1/spots")).send().await?;
            let list: SpotList = decode(resp).await?;
            if list.spots.is_empty() {
                println!("No spots registered.");
            }
            for s in list.spots {
                println!("Spot {}", s.spot_id);
                println!("  ip             : {}", s.ip_address);
                println!("  status         : {}", s.status);
                println!("  cpu            : {:.1}%", s.cpu_load);
                println!("  running/cores  : {}/{}", s.running_tasks, s.total_cores);
                println!("  last heartbeat : {}", s.last_heartbeat);
                println!();
            }
        }

        Commands::Health => {
            let resp = client.get(format!("{base_url}/api/v1/health")).send().await?;
            let health: HealthResponse = decode(resp).await?;
            println!("status        : {}", health.status);
            println!("uptime        : {}s", health.uptime);
            println!("active spots  : {}", health.active_spots);
            println!("pending tasks : {}", health.pending_tasks);
            println!("running tasks : {}", health.running_tasks);
        }
    }

    Ok(())
}
