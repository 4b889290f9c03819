use crate::config::ConnectionConfig;
use crate::core::protocol::{
    flatten_tool_result, parse_tools_list, JsonRpcRequest, ToolDescriptor, METHOD_INITIALIZED,
};
use crate::transport::{Transport, TransportFactory};
use crate::utils::errors::{HubError, HubResult};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

const CLIENT_NAME: &str = "mcp-hub";

/// One downstream MCP server and the tools it advertises
pub struct Connection {
    name: String,
    command_line: String,
    transport: Box<dyn Transport>,
    tools: RwLock<Arc<Vec<ToolDescriptor>>>,
}

impl Connection {
    /// Wrap an already-open transport. No handshake is performed.
    pub fn new(
        name: impl Into<String>,
        command_line: impl Into<String>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            transport,
            tools: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Open the transport and run the initialize handshake.
    ///
    /// The connection is only returned once its tool list has been fetched.
    pub async fn start(
        config: &ConnectionConfig,
        factory: &dyn TransportFactory,
    ) -> HubResult<Self> {
        info!(connection = %config.name, "Starting {}", config.command_line());
        let transport = factory.connect(&config.name, config).await?;
        let connection = Self::new(config.name.clone(), config.command_line(), transport);

        if let Err(e) = connection.handshake().await {
            connection.stop().await;
            return Err(e);
        }
        Ok(connection)
    }

    async fn handshake(&self) -> HubResult<()> {
        let handshake_error = |e: HubError| HubError::Handshake {
            connection: self.name.clone(),
            message: e.to_string(),
        };

        let init = self
            .transport
            .send_request(JsonRpcRequest::initialize(CLIENT_NAME))
            .await
            .map_err(handshake_error)?;
        if let Some(error) = init.error {
            return Err(HubError::Handshake {
                connection: self.name.clone(),
                message: error.message,
            });
        }

        self.notify(METHOD_INITIALIZED).await.map_err(handshake_error)?;
        let count = self.refresh_tools().await.map_err(handshake_error)?;
        info!(connection = %self.name, "Connected with {} tools", count);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// Send a request and return its `result`, or the peer's error message
    pub async fn send(&self, method: &str, params: Option<Value>) -> HubResult<Value> {
        let response = self
            .transport
            .send_request(JsonRpcRequest::new(method, params))
            .await?;
        match response.error {
            Some(error) => Err(HubError::Remote(error.message)),
            None => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    pub async fn notify(&self, method: &str) -> HubResult<()> {
        self.transport
            .send_notification(JsonRpcRequest::notification(method))
            .await
    }

    /// Fetch the advertised tools without touching the stored list
    pub async fn list_tools(&self) -> HubResult<Vec<ToolDescriptor>> {
        let response = self.transport.send_request(JsonRpcRequest::tools_list()).await?;
        if let Some(error) = response.error {
            return Err(HubError::Remote(error.message));
        }
        let result = response.result.unwrap_or(Value::Null);
        Ok(parse_tools_list(&result, &self.name))
    }

    /// Replace the stored tool list wholesale
    pub async fn refresh_tools(&self) -> HubResult<usize> {
        let tools = self.list_tools().await?;
        let count = tools.len();
        debug!(connection = %self.name, "Tool list refreshed ({} tools)", count);
        *self.tools.write() = Arc::new(tools);
        Ok(count)
    }

    pub fn tools(&self) -> Arc<Vec<ToolDescriptor>> {
        self.tools.read().clone()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.read().iter().any(|tool| tool.name == name)
    }

    /// Invoke a tool, flattening text content blocks into a single string
    pub async fn call(&self, tool: &str, arguments: Value) -> HubResult<Value> {
        debug!(connection = %self.name, tool = %tool, "Calling tool");
        let request = JsonRpcRequest::tools_call(tool, arguments);
        let response = self.transport.send_request(request).await?;
        if let Some(error) = response.error {
            return Err(HubError::Remote(error.message));
        }

        let result = response.result.unwrap_or(Value::Null);
        let failed = result.get("isError").and_then(Value::as_bool) == Some(true);
        match flatten_tool_result(result) {
            Value::String(message) if failed => Err(HubError::Remote(message)),
            flattened if failed => Err(HubError::Remote(flattened.to_string())),
            flattened => Ok(flattened),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.is_connected().await
    }

    /// Terminate the downstream process. Safe to call more than once.
    pub async fn stop(&self) {
        if let Err(e) = self.transport.close().await {
            warn!(connection = %self.name, "Error while stopping: {}", e);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("command_line", &self.command_line)
            .field("tools", &self.tools.read().len())
            .finish()
    }
}
