//! Handlers the agent registers on its own, independent of any backend.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bus::{BusError, Command, CommandBus, CommandHandler, Query, QueryBus, QueryHandler};
use crate::host::{CapabilityProvider, AGENT_VERSION};
use crate::identity::AgentId;

/// Liveness probe. Carries no payload and does nothing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ping;

impl Command for Ping {
    const KIND: &'static str = "Ping";
}

pub struct PingHandler;

#[async_trait]
impl CommandHandler for PingHandler {
    type Command = Ping;

    async fn handle(&self, _command: Ping) -> anyhow::Result<()> {
        debug!("Ping");
        Ok(())
    }
}

/// Ask the agent to describe itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentInfo;

impl Query for AgentInfo {
    const KIND: &'static str = "AgentInfo";
    type Output = AgentInfoReport;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfoReport {
    pub agent_id: String,
    pub version: String,
    pub started_at: DateTime<Utc>,
    pub capabilities: HashMap<String, String>,
    pub features: HashMap<String, bool>,
}

pub struct AgentInfoHandler {
    agent_id: AgentId,
    capabilities: Arc<dyn CapabilityProvider>,
    started_at: DateTime<Utc>,
}

impl AgentInfoHandler {
    pub fn new(agent_id: AgentId, capabilities: Arc<dyn CapabilityProvider>) -> Self {
        Self {
            agent_id,
            capabilities,
            started_at: Utc::now(),
        }
    }
}

#[async_trait]
impl QueryHandler for AgentInfoHandler {
    type Query = AgentInfo;

    async fn handle(&self, _query: AgentInfo) -> anyhow::Result<AgentInfoReport> {
        let snapshot = self.capabilities.snapshot();
        Ok(AgentInfoReport {
            agent_id: self.agent_id.to_string(),
            version: AGENT_VERSION.to_string(),
            started_at: self.started_at,
            capabilities: snapshot.capabilities,
            features: snapshot.features,
        })
    }
}

/// Register the built-in handlers on both buses.
pub fn register_builtin(
    commands: &CommandBus,
    queries: &QueryBus,
    agent_id: AgentId,
    capabilities: Arc<dyn CapabilityProvider>,
) -> Result<(), BusError> {
    commands.register(PingHandler)?;
    queries.register(AgentInfoHandler::new(agent_id, capabilities))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostCapabilities;

    #[tokio::test]
    async fn test_builtin_handlers() {
        let commands = CommandBus::new();
        let queries = QueryBus::new();
        let capabilities = Arc::new(HostCapabilities::new().with_feature("ping", true));
        register_builtin(&commands, &queries, "node-1".parse().unwrap(), capabilities).unwrap();

        commands.dispatch("Ping", b"").await.unwrap();
        commands.dispatch("Ping", b"null").await.unwrap();

        let report = queries.ask(&AgentInfo).await.unwrap();
        assert_eq!(report.agent_id, "node-1");
        assert_eq!(report.version, AGENT_VERSION);
        assert_eq!(report.features.get("ping"), Some(&true));

        let raw = queries.dispatch("AgentInfo", b"").await.unwrap();
        let decoded: AgentInfoReport = serde_json::from_slice(&raw).unwrap();
        assert_eq!(decoded.agent_id, "node-1");
    }

    #[tokio::test]
    async fn test_builtin_registration_is_not_repeatable() {
        let commands = CommandBus::new();
        let queries = QueryBus::new();
        let capabilities: Arc<dyn CapabilityProvider> = Arc::new(HostCapabilities::new());
        register_builtin(&commands, &queries, "node-1".parse().unwrap(), Arc::clone(&capabilities))
            .unwrap();

        let err = register_builtin(&commands, &queries, "node-1".parse().unwrap(), capabilities)
            .unwrap_err();
        assert!(matches!(err, BusError::DuplicateHandler(ref kind) if kind == "Ping"));
    }
}
