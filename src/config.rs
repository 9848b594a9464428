//! Process configuration from flags and environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::engine::EngineConfig;
use crate::registry::ProbeConfig;

/// Environment variable names, shared by flag parsing and error messages.
pub mod env {
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const SERVER_PORT: &str = "SERVER_PORT";
    pub const DATA_DIR: &str = "DATA_DIR";
    pub const EMBEDDED_CLUSTER: &str = "EMBEDDED_CLUSTER";
    pub const AIRGAP_BUNDLE_DIR: &str = "AIRGAP_BUNDLE_DIR";
    pub const UPGRADE_HELPER: &str = "UPGRADE_HELPER";
    pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
    pub const MONITOR_INTERVAL_SECS: &str = "MONITOR_INTERVAL_SECS";
    pub const STEP_POLL_INTERVAL_SECS: &str = "STEP_POLL_INTERVAL_SECS";
    pub const REMOTE_STEP_TIMEOUT_SECS: &str = "REMOTE_STEP_TIMEOUT_SECS";
    pub const MANAGER_UPGRADE_TIMEOUT_SECS: &str = "MANAGER_UPGRADE_TIMEOUT_SECS";
    pub const MANAGER_POLL_INTERVAL_SECS: &str = "MANAGER_POLL_INTERVAL_SECS";
    pub const PING_MIN_SECS: &str = "PING_MIN_SECS";
    pub const PING_MAX_SECS: &str = "PING_MAX_SECS";
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "ecup",
    version,
    about = "Upgrade planner and EC manager dispatcher for embedded clusters"
)]
pub struct Config {
    /// Log format: json or pretty
    #[arg(long, env = env::LOG_FORMAT, default_value = "json")]
    pub log_format: String,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Port for the API, agent websocket, metrics and health endpoints
    #[arg(long, env = env::SERVER_PORT, default_value = "3000")]
    pub server_port: u16,

    /// Directory for persisted plan state. Plans are kept in memory when unset.
    #[arg(long, env = env::DATA_DIR)]
    pub data_dir: Option<PathBuf>,

    /// Read cluster facts from the Kubernetes API
    #[arg(long, env = env::EMBEDDED_CLUSTER, default_value = "false")]
    pub embedded_cluster: bool,

    /// Directory holding unpacked airgap bundles, one subdirectory per app slug
    #[arg(long, env = env::AIRGAP_BUNDLE_DIR)]
    pub airgap_bundle_dir: Option<PathBuf>,

    /// Helper binary that prepares and deploys application versions
    #[arg(long, env = env::UPGRADE_HELPER, default_value = "/usr/local/bin/upgrade-service")]
    pub upgrade_helper: PathBuf,

    /// Slack Incoming Webhook for plan notifications
    #[arg(long, env = env::SLACK_WEBHOOK_URL)]
    pub slack_webhook_url: Option<String>,

    #[arg(long, env = env::MONITOR_INTERVAL_SECS, default_value = "2")]
    pub monitor_interval_secs: u64,

    #[arg(long, env = env::STEP_POLL_INTERVAL_SECS, default_value = "2")]
    pub step_poll_interval_secs: u64,

    /// Upper bound for a cluster or extension step
    #[arg(long, env = env::REMOTE_STEP_TIMEOUT_SECS, default_value = "3600")]
    pub remote_step_timeout_secs: u64,

    /// How long an upgraded EC manager has to reconnect
    #[arg(long, env = env::MANAGER_UPGRADE_TIMEOUT_SECS, default_value = "300")]
    pub manager_upgrade_timeout_secs: u64,

    #[arg(long, env = env::MANAGER_POLL_INTERVAL_SECS, default_value = "5")]
    pub manager_poll_interval_secs: u64,

    /// Lower bound of the randomized ping interval
    #[arg(long, env = env::PING_MIN_SECS, default_value = "5")]
    pub ping_min_secs: u64,

    /// Upper bound of the randomized ping interval
    #[arg(long, env = env::PING_MAX_SECS, default_value = "20")]
    pub ping_max_secs: u64,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn validate(&self) -> Result<(), String> {
        let intervals = [
            (env::MONITOR_INTERVAL_SECS, self.monitor_interval_secs),
            (env::STEP_POLL_INTERVAL_SECS, self.step_poll_interval_secs),
            (env::REMOTE_STEP_TIMEOUT_SECS, self.remote_step_timeout_secs),
            (
                env::MANAGER_UPGRADE_TIMEOUT_SECS,
                self.manager_upgrade_timeout_secs,
            ),
            (env::MANAGER_POLL_INTERVAL_SECS, self.manager_poll_interval_secs),
            (env::PING_MIN_SECS, self.ping_min_secs),
        ];
        let zero: Vec<&str> = intervals
            .iter()
            .filter(|(_, secs)| *secs == 0)
            .map(|(name, _)| *name)
            .collect();
        if !zero.is_empty() {
            return Err(format!("must be greater than zero: {}", zero.join(", ")));
        }

        if self.ping_max_secs < self.ping_min_secs {
            return Err(format!(
                "{} ({}) must not be less than {} ({})",
                env::PING_MAX_SECS,
                self.ping_max_secs,
                env::PING_MIN_SECS,
                self.ping_min_secs
            ));
        }

        if self
            .slack_webhook_url
            .as_deref()
            .is_some_and(|url| !url.is_empty() && !url.starts_with("https://"))
        {
            return Err(format!("{} must be an https URL", env::SLACK_WEBHOOK_URL));
        }
        Ok(())
    }

    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            step_poll_interval: Duration::from_secs(self.step_poll_interval_secs),
            remote_step_timeout: Duration::from_secs(self.remote_step_timeout_secs),
            manager_upgrade_timeout: Duration::from_secs(self.manager_upgrade_timeout_secs),
            manager_poll_interval: Duration::from_secs(self.manager_poll_interval_secs),
        }
    }

    pub const fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            min_interval: Duration::from_secs(self.ping_min_secs),
            max_interval: Duration::from_secs(self.ping_max_secs),
        }
    }

    /// Slack webhook, treating an empty value as unset.
    pub fn slack_webhook(&self) -> Option<&str> {
        self.slack_webhook_url.as_deref().filter(|url| !url.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> Config {
        Config::parse_from(["ecup"])
    }

    #[test]
    fn test_defaults() {
        let config = default_config();
        assert_eq!(config.server_port, 3000);
        assert!(config.data_dir.is_none());
        assert!(!config.embedded_cluster);
        assert!(config.validate().is_ok());

        let engine = config.engine_config();
        assert_eq!(engine.monitor_interval, Duration::from_secs(2));
        assert_eq!(engine.manager_upgrade_timeout, Duration::from_secs(300));
        assert_eq!(engine.manager_poll_interval, Duration::from_secs(5));

        let probe = config.probe_config();
        assert_eq!(probe.min_interval, Duration::from_secs(5));
        assert_eq!(probe.max_interval, Duration::from_secs(20));
    }

    #[test]
    fn test_validate_inverted_ping_bounds() {
        let mut config = default_config();
        config.ping_min_secs = 30;
        let err = config.validate().unwrap_err();
        assert!(err.contains("PING_MAX_SECS"));
    }

    #[test]
    fn test_validate_zero_intervals() {
        let mut config = default_config();
        config.monitor_interval_secs = 0;
        config.manager_poll_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.contains("MONITOR_INTERVAL_SECS"));
        assert!(err.contains("MANAGER_POLL_INTERVAL_SECS"));
    }

    #[test]
    fn test_slack_webhook() {
        let mut config = default_config();
        config.slack_webhook_url = Some(String::new());
        assert!(config.slack_webhook().is_none());
        assert!(config.validate().is_ok());

        config.slack_webhook_url = Some("http://hooks.slack.com/x".to_string());
        assert!(config.validate().is_err());

        config.slack_webhook_url = Some("https://hooks.slack.com/services/T0/B0/x".to_string());
        assert_eq!(
            config.slack_webhook(),
            Some("https://hooks.slack.com/services/T0/B0/x")
        );
    }

    #[test]
    fn test_flags_override_defaults() {
        let config = Config::parse_from([
            "ecup",
            "--data-dir",
            "/var/lib/ecup",
            "--embedded-cluster",
            "--ping-max-secs",
            "40",
        ]);
        assert_eq!(config.data_dir, Some(PathBuf::from("/var/lib/ecup")));
        assert!(config.embedded_cluster);
        assert_eq!(config.probe_config().max_interval, Duration::from_secs(40));
    }
}
