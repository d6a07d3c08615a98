use std::time::Duration;

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "agent", version, about = "Orhestra spot agent")]
pub struct AgentConfig {
    #[arg(
        long,
        long_help = "Base URL of the coordinator",
        env = "ORHESTRA_COORDINATOR_URL",
        default_value = "http://localhost:8081"
    )]
    pub coordinator_url: String,

    #[arg(
        long,
        long_help = "Shared secret sent in X-Orhestra-Key on every call",
        env = "ORHESTRA_AGENT_KEY"
    )]
    pub agent_key: Option<String>,

    #[arg(
        long,
        long_help = "Shell command run once per task; the payload JSON arrives on stdin",
        env = "ORHESTRA_EXEC",
        default_value = "cat"
    )]
    pub exec: String,

    #[arg(
        long,
        long_help = "Tasks executed at the same time",
        env = "ORHESTRA_MAX_PARALLEL",
        default_value_t = 2
    )]
    pub max_parallel: usize,

    #[arg(
        long,
        long_help = "Seconds between heartbeats",
        env = "ORHESTRA_HEARTBEAT_SECS",
        default_value_t = 10
    )]
    pub heartbeat_secs: u64,

    #[arg(
        long,
        long_help = "Seconds to wait before claiming again when idle or saturated",
        env = "ORHESTRA_POLL_SECS",
        default_value_t = 2
    )]
    pub poll_secs: u64,
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.max_parallel > 0, "max-parallel must be at least 1");
        anyhow::ensure!(self.heartbeat_secs > 0, "heartbeat-secs must be greater than 0");
        anyhow::ensure!(self.poll_secs > 0, "poll-secs must be greater than 0");
        anyhow::ensure!(!self.exec.trim().is_empty(), "exec must not be empty");
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = AgentConfig::try_parse_from(["agent"]).unwrap();
        assert_eq!(cfg.max_parallel, 2);
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_parallelism_is_rejected() {
        let cfg = AgentConfig::try_parse_from(["agent", "--max-parallel", "0"]).unwrap();
        assert!(cfg.validate().is_err());
    }
}
