use crate::config::{ConnectionConfig, DuplicatePolicy};
use crate::core::connection::Connection;
use crate::core::protocol::ToolDescriptor;
use crate::recovery::{RemediationAction, Remediator};
use crate::transport::TransportFactory;
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Routes tool calls to the connection that advertises the tool.
///
/// Connections are kept in startup order; lookups walk that order, so the
/// first connection to advertise a name owns it.
pub struct Hub {
    connections: RwLock<Vec<Arc<Connection>>>,
    policy: DuplicatePolicy,
}

impl Hub {
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            policy,
        }
    }

    /// Start every enabled connection in order and return the tool count.
    ///
    /// A connection that fails to start is logged and left out.
    pub async fn start(
        &self,
        configs: &[ConnectionConfig],
        factory: &dyn TransportFactory,
    ) -> usize {
        for config in configs {
            if config.disabled {
                info!(connection = %config.name, "Skipping disabled connection");
                continue;
            }

            match Connection::start(config, factory).await {
                Ok(connection) => {
                    if let Err(e) = self.register(Arc::new(connection)).await {
                        error!(connection = %config.name, "Excluded: {}", e);
                    }
                }
                Err(e) => error!(connection = %config.name, "Failed to start: {}", e),
            }
        }

        let count = self.tool_count();
        info!(
            "Hub ready: {} connections, {} tools",
            self.connections.read().len(),
            count
        );
        count
    }

    /// Make a started connection visible for routing
    pub async fn register(&self, connection: Arc<Connection>) -> HubResult<()> {
        let rejected = {
            let mut connections = self.connections.write();
            if connections.iter().any(|c| c.name() == connection.name()) {
                Some(HubError::Config(format!(
                    "connection '{}' is already registered",
                    connection.name()
                )))
            } else {
                match self.find_conflict(&connections, &connection) {
                    Some(conflict) if self.policy == DuplicatePolicy::Reject => Some(conflict),
                    conflict => {
                        if let Some(conflict) = conflict {
                            warn!("{}; the first registration wins", conflict);
                        }
                        connections.push(connection.clone());
                        None
                    }
                }
            }
        };

        match rejected {
            Some(e) => {
                connection.stop().await;
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn find_conflict(
        &self,
        connections: &[Arc<Connection>],
        candidate: &Connection,
    ) -> Option<HubError> {
        candidate.tools().iter().find_map(|tool| {
            connections
                .iter()
                .find(|c| c.has_tool(&tool.name))
                .map(|owner| HubError::DuplicateCapability {
                    tool: tool.name.clone(),
                    connection: candidate.name().to_string(),
                    owner: owner.name().to_string(),
                })
        })
    }

    /// First connection, in registration order, that advertises `tool`
    pub fn find_owner(&self, tool: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.has_tool(tool))
            .cloned()
    }

    /// Call `tool` on its owner. Fails without any I/O if nobody owns it.
    pub async fn invoke(&self, tool: &str, arguments: Value) -> HubResult<Value> {
        let owner = self
            .find_owner(tool)
            .ok_or_else(|| HubError::CapabilityNotFound(tool.to_string()))?;
        owner.call(tool, arguments).await
    }

    /// Re-fetch every live connection's tool list and drop dead connections
    pub async fn reload(&self) -> usize {
        let snapshot: Vec<Arc<Connection>> = self.connections.read().clone();
        let mut dead = HashSet::new();

        for connection in &snapshot {
            if !connection.is_connected().await {
                warn!(connection = %connection.name(), "Process is gone, removing connection");
                connection.stop().await;
                dead.insert(connection.name().to_string());
                continue;
            }
            if let Err(e) = connection.refresh_tools().await {
                warn!(connection = %connection.name(), "Tool reload failed: {}", e);
            }
        }

        if !dead.is_empty() {
            self.connections
                .write()
                .retain(|c| !dead.contains(c.name()));
        }

        let count = self.tool_count();
        info!("Reloaded tools: {} available", count);
        count
    }

    /// The flattened tool directory. A name shadowed by an earlier
    /// connection is listed only once.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        let connections = self.connections.read();
        let mut seen = HashSet::new();
        let mut tools = Vec::new();
        for connection in connections.iter() {
            for tool in connection.tools().iter() {
                if seen.insert(tool.name.clone()) {
                    tools.push(tool.clone());
                }
            }
        }
        tools
    }

    pub fn tool_count(&self) -> usize {
        self.tools().len()
    }

    pub fn connection_names(&self) -> Vec<String> {
        self.connections
            .read()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.name() == name)
            .cloned()
    }

    /// Stop and forget every connection
    pub async fn stop(&self) {
        let connections: Vec<Arc<Connection>> = std::mem::take(&mut *self.connections.write());
        for connection in connections {
            info!(connection = %connection.name(), "Stopping");
            connection.stop().await;
        }
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}

#[async_trait]
impl Remediator for Hub {
    async fn remediate(&self, action: RemediationAction) -> HubResult<()> {
        match action {
            RemediationAction::ReloadTools => {
                self.reload().await;
            }
            RemediationAction::RebuildContext => {
                info!("Context rebuild requested; the downstream server handles it on the next call")
            }
            RemediationAction::RefreshSnapshot => {
                info!("Snapshot refresh suggested to the caller")
            }
        }
        Ok(())
    }
}
