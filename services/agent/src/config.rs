//! Configuration for the fleet agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::backoff::BackoffPolicy;
use crate::identity::AgentId;
use crate::transport::TlsPaths;

/// Fleet agent configuration.
///
/// Built once at startup and handed to each component by reference.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of this node.
    pub agent_id: AgentId,

    /// Control server gRPC URL.
    pub server_url: String,

    /// Mutual TLS material.
    pub tls: TlsPaths,

    /// Heartbeat cadence on the control stream.
    pub heartbeat_interval: Duration,

    /// Metrics cadence on the control stream.
    pub metrics_interval: Duration,

    /// Retry delays for reconnects, stream recreation and registration.
    pub backoff: BackoffPolicy,

    /// Timeout for establishing a connection.
    pub connect_timeout: Duration,

    /// Buffered requests per kind before new arrivals are rejected.
    pub queue_capacity: usize,

    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let agent_id = std::env::var("FLEET_AGENT_ID")
            .context("FLEET_AGENT_ID must be set")?
            .parse()
            .context("invalid FLEET_AGENT_ID")?;

        let server_url = std::env::var("FLEET_SERVER_URL")
            .unwrap_or_else(|_| "https://127.0.0.1:8443".to_string());

        let tls = TlsPaths {
            ca_cert: env_path("FLEET_CA_CERT", "/etc/fleet/ca.pem"),
            agent_cert: env_path("FLEET_AGENT_CERT", "/etc/fleet/agent.pem"),
            agent_key: env_path("FLEET_AGENT_KEY", "/etc/fleet/agent-key.pem"),
            domain: std::env::var("FLEET_TLS_DOMAIN").ok(),
        };

        let config = Self {
            agent_id,
            server_url,
            tls,
            heartbeat_interval: Duration::from_secs(env_parse("FLEET_HEARTBEAT_INTERVAL", 10)?),
            metrics_interval: Duration::from_secs(env_parse("FLEET_METRICS_INTERVAL", 60)?),
            backoff: BackoffPolicy {
                min: Duration::from_millis(env_parse("FLEET_BACKOFF_MIN_MS", 500)?),
                max: Duration::from_secs(env_parse("FLEET_BACKOFF_MAX_SECS", 30)?),
            },
            connect_timeout: Duration::from_secs(env_parse("FLEET_CONNECT_TIMEOUT", 10)?),
            queue_capacity: env_parse("FLEET_QUEUE_CAPACITY", 1)?,
            shutdown_grace: Duration::from_secs(env_parse("FLEET_SHUTDOWN_GRACE", 10)?),
            log_level: std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Configuration with default cadences for the given identity and server.
    pub fn new(agent_id: AgentId, server_url: impl Into<String>, tls: TlsPaths) -> Self {
        Self {
            agent_id,
            server_url: server_url.into(),
            tls,
            heartbeat_interval: Duration::from_secs(10),
            metrics_interval: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
            connect_timeout: Duration::from_secs(10),
            queue_capacity: 1,
            shutdown_grace: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }

    /// Reject settings the agent cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.metrics_interval.is_zero() {
            bail!("metrics interval must be greater than zero");
        }
        if self.queue_capacity == 0 {
            bail!("request queue capacity must be at least 1");
        }
        if self.backoff.min > self.backoff.max {
            bail!(
                "backoff minimum ({:?}) exceeds maximum ({:?})",
                self.backoff.min,
                self.backoff.max
            );
        }
        Ok(())
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key} value '{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(
            "node-1".parse().unwrap(),
            "https://control.example.com",
            TlsPaths {
                ca_cert: "/tmp/ca.pem".into(),
                agent_cert: "/tmp/agent.pem".into(),
                agent_key: "/tmp/agent-key.pem".into(),
                domain: None,
            },
        )
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        config.validate().unwrap();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(config.metrics_interval, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, 1);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = config();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_backoff() {
        let mut config = config();
        config.backoff = BackoffPolicy {
            min: Duration::from_secs(5),
            max: Duration::from_secs(1),
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backoff minimum"));
    }

    #[test]
    fn test_env_parse_reports_bad_values() {
        std::env::set_var("FLEET_TEST_BAD_INTERVAL", "ten");
        let err = env_parse::<u64>("FLEET_TEST_BAD_INTERVAL", 10).unwrap_err();
        assert!(err.to_string().contains("FLEET_TEST_BAD_INTERVAL"));
        std::env::remove_var("FLEET_TEST_BAD_INTERVAL");

        assert_eq!(env_parse::<u64>("FLEET_TEST_UNSET_INTERVAL", 7).unwrap(), 7);
    }
}
