use crate::config::ConnectionConfig;
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::utils::errors::HubResult;
use async_trait::async_trait;

/// Transport for MCP communication
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for its matching response
    async fn send_request(&self, request: JsonRpcRequest) -> HubResult<JsonRpcResponse>;

    /// Send a notification (no response expected)
    async fn send_notification(&self, request: JsonRpcRequest) -> HubResult<()>;

    /// Check if transport is connected
    async fn is_connected(&self) -> bool;

    /// Close the transport. Never fails once the peer is gone.
    async fn close(&self) -> HubResult<()>;
}

/// Opens transports for configured connections
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> HubResult<Box<dyn Transport>>;
}
