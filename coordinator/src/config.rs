use std::time::Duration;

use clap::Parser;

use crate::error::{CoordinatorError, Result};

/// Upper bound for every duration flag: one year.
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Parser)]
#[command(name = "coordinator", version, about = "Orhestra task coordinator")]
pub struct Config {
    #[arg(
        long,
        long_help = "Store URL: `memory` for an in-process store or a postgres:// URL",
        env = "ORHESTRA_DATABASE_URL",
        default_value = "memory"
    )]
    pub database_url: String,

    #[arg(
        long,
        long_help = "HTTP listen port",
        env = "ORHESTRA_PORT",
        default_value_t = 8081
    )]
    pub listen_port: u16,

    #[arg(
        long,
        long_help = "Default attempts per task when a job does not set its own",
        env = "ORHESTRA_MAX_ATTEMPTS",
        default_value_t = 3
    )]
    pub max_attempts: i32,

    #[arg(
        long,
        long_help = "Shared secret required in X-Orhestra-Key on internal calls; unset disables the check",
        env = "ORHESTRA_AGENT_KEY"
    )]
    pub agent_key: Option<String>,

    #[arg(
        long,
        long_help = "Seconds a task may stay RUNNING before the reaper recovers it",
        env = "ORHESTRA_STUCK_THRESHOLD_SECS",
        default_value_t = 600
    )]
    pub stuck_threshold_secs: u64,

    #[arg(
        long,
        long_help = "Seconds between reaper sweeps",
        env = "ORHESTRA_REAPER_INTERVAL_SECS",
        default_value_t = 60
    )]
    pub reaper_interval_secs: u64,

    #[arg(
        long,
        long_help = "Seconds between spot staleness sweeps",
        env = "ORHESTRA_CLEANUP_INTERVAL_SECS",
        default_value_t = 30
    )]
    pub cleanup_interval_secs: u64,

    #[arg(
        long,
        long_help = "Seconds without a heartbeat before a spot is marked DOWN",
        env = "ORHESTRA_HEARTBEAT_TIMEOUT_SECS",
        default_value_t = 90
    )]
    pub heartbeat_timeout_secs: u64,

    #[arg(
        long,
        long_help = "Maximum Postgres pool connections",
        env = "ORHESTRA_DB_MAX_CONNECTIONS",
        default_value_t = 16
    )]
    pub db_max_connections: u32,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(CoordinatorError::Validation(format!(
                "max-attempts must be at least 1, got {}",
                self.max_attempts
            )));
        }
        for (name, value) in [
            ("stuck-threshold-secs", self.stuck_threshold_secs),
            ("reaper-interval-secs", self.reaper_interval_secs),
            ("cleanup-interval-secs", self.cleanup_interval_secs),
            ("heartbeat-timeout-secs", self.heartbeat_timeout_secs),
        ] {
            if value == 0 || value > MAX_DURATION_SECS {
                return Err(CoordinatorError::Validation(format!(
                    "{name} must be between 1 and {MAX_DURATION_SECS}, got {value}"
                )));
            }
        }
        if self.db_max_connections == 0 {
            return Err(CoordinatorError::Validation(
                "db-max-connections must be greater than 0".into(),
            ));
        }
        if self.agent_key.as_deref().is_some_and(|k| k.is_empty()) {
            return Err(CoordinatorError::Validation(
                "agent-key must not be empty when set".into(),
            ));
        }
        Ok(())
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::try_parse_from(["coordinator"]).unwrap();
        assert_eq!(cfg.database_url, "memory");
        assert_eq!(cfg.listen_port, 8081);
        assert_eq!(cfg.max_attempts, 3);
        assert_eq!(cfg.stuck_threshold_secs, 600);
        assert_eq!(cfg.heartbeat_timeout_secs, 90);
        assert!(cfg.agent_key.is_none());
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_interval_is_rejected() {
        let cfg =
            Config::try_parse_from(["coordinator", "--reaper-interval-secs", "0"]).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn huge_durations_are_rejected() {
        for flag in ["--stuck-threshold-secs", "--heartbeat-timeout-secs", "--cleanup-interval-secs"] {
            let cfg = Config::try_parse_from(["coordinator", flag, "18446744073709551615"]).unwrap();
            assert!(cfg.validate().is_err(), "{flag} accepted u64::MAX");
        }
        let cfg = Config::try_parse_from([
            "coordinator",
            "--stuck-threshold-secs",
            MAX_DURATION_SECS.to_string().as_str(),
        ])
        .unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let cfg = Config::try_parse_from(["coordinator", "--max-attempts", "0"]).unwrap();
        assert!(cfg.validate().is_err());
    }
}
