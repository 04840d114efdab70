//! Host-facing collaborators of the control channel.
//!
//! - `CapabilityProvider`: capability and feature snapshot sent on
//!   registration and at every stream start
//! - `MetricsProvider`: values sent on the metrics cadence
//! - `UpdateHandler`: applies agent-update requests from the server

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use tracing::warn;

/// Agent version reported to the server.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capabilities and declared feature flags of this host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapabilitySnapshot {
    pub capabilities: HashMap<String, String>,
    pub features: HashMap<String, bool>,
}

/// Source of the capability snapshot. Must be cheap and synchronous.
pub trait CapabilityProvider: Send + Sync + 'static {
    fn snapshot(&self) -> CapabilitySnapshot;
}

/// Capabilities read from the running host.
#[derive(Debug, Clone, Default)]
pub struct HostCapabilities {
    labels: HashMap<String, String>,
    features: HashMap<String, bool>,
}

impl HostCapabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a feature flag.
    pub fn with_feature(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.features.insert(name.into(), enabled);
        self
    }

    /// Add a static capability. Overrides detected values with the same key.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

impl CapabilityProvider for HostCapabilities {
    fn snapshot(&self) -> CapabilitySnapshot {
        let mut capabilities = HashMap::from([
            ("hostname".to_string(), hostname()),
            ("os".to_string(), std::env::consts::OS.to_string()),
            ("arch".to_string(), std::env::consts::ARCH.to_string()),
            ("agent_version".to_string(), AGENT_VERSION.to_string()),
        ]);
        if let Ok(cpus) = std::thread::available_parallelism() {
            capabilities.insert("cpu_count".to_string(), cpus.get().to_string());
        }
        capabilities.extend(self.labels.clone());

        CapabilitySnapshot {
            capabilities,
            features: self.features.clone(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Source of the values sent on the metrics cadence.
pub trait MetricsProvider: Send + Sync + 'static {
    fn collect(&self) -> HashMap<String, f64>;
}

/// Load and memory figures from `/proc`, plus agent uptime.
///
/// Values that cannot be read are left out.
#[derive(Debug)]
pub struct HostMetrics {
    started: Instant,
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for HostMetrics {
    fn collect(&self) -> HashMap<String, f64> {
        let mut values = HashMap::new();
        values.insert(
            "agent_uptime_seconds".to_string(),
            self.started.elapsed().as_secs_f64(),
        );

        if let Ok(raw) = std::fs::read_to_string("/proc/loadavg") {
            values.extend(parse_loadavg(&raw));
        }
        if let Ok(raw) = std::fs::read_to_string("/proc/meminfo") {
            values.extend(parse_meminfo(&raw));
        }
        values
    }
}

fn parse_loadavg(raw: &str) -> Vec<(String, f64)> {
    ["load1", "load5", "load15"]
        .iter()
        .zip(raw.split_whitespace())
        .filter_map(|(name, field)| field.parse().ok().map(|v| (name.to_string(), v)))
        .collect()
}

fn parse_meminfo(raw: &str) -> Vec<(String, f64)> {
    raw.lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let name = match key {
                "MemTotal" => "memory_total_bytes",
                "MemAvailable" => "memory_available_bytes",
                _ => return None,
            };
            let kib: f64 = rest.split_whitespace().next()?.parse().ok()?;
            Some((name.to_string(), kib * 1024.0))
        })
        .collect()
}

/// Agent-update request from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentUpdate {
    pub version: String,
    pub artifact_url: String,
    pub sha256: String,
}

/// Applies agent updates. Runs inline on the receive path and may end the
/// process.
#[async_trait]
pub trait UpdateHandler: Send + Sync + 'static {
    async fn apply(&self, update: AgentUpdate) -> anyhow::Result<()>;
}

/// Declines every update request.
#[derive(Debug, Default)]
pub struct RejectUpdates;

#[async_trait]
impl UpdateHandler for RejectUpdates {
    async fn apply(&self, update: AgentUpdate) -> anyhow::Result<()> {
        warn!(version = %update.version, "Agent update requested but self-update is disabled");
        anyhow::bail!(
            "self-update is disabled on this agent (requested version {})",
            update.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        let values: HashMap<_, _> = parse_loadavg("0.52 0.58 0.59 1/389 12345\n")
            .into_iter()
            .collect();
        assert_eq!(values["load1"], 0.52);
        assert_eq!(values["load15"], 0.59);
        assert_eq!(values.len(), 3);
    }

    #[test]
    fn test_parse_meminfo() {
        let raw = "MemTotal:       16318012 kB\nMemFree:  1000 kB\nMemAvailable:    8000000 kB\n";
        let values: HashMap<_, _> = parse_meminfo(raw).into_iter().collect();
        assert_eq!(values["memory_total_bytes"], 16318012.0 * 1024.0);
        assert_eq!(values["memory_available_bytes"], 8000000.0 * 1024.0);
        assert!(!values.contains_key("MemFree"));
    }

    #[test]
    fn test_host_capabilities_snapshot() {
        let snapshot = HostCapabilities::new()
            .with_feature("compose_v2", true)
            .with_label("region", "eu-west")
            .snapshot();

        assert_eq!(snapshot.capabilities["os"], std::env::consts::OS);
        assert_eq!(snapshot.capabilities["region"], "eu-west");
        assert_eq!(snapshot.capabilities["agent_version"], AGENT_VERSION);
        assert_eq!(snapshot.features.get("compose_v2"), Some(&true));
    }

    #[test]
    fn test_host_metrics_reports_uptime() {
        let values = HostMetrics::new().collect();
        assert!(values["agent_uptime_seconds"] >= 0.0);
    }

    #[tokio::test]
    async fn test_reject_updates() {
        let err = RejectUpdates
            .apply(AgentUpdate {
                version: "2.0.0".into(),
                artifact_url: "https://example.com/agent".into(),
                sha256: "abc".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2.0.0"));
    }
}
