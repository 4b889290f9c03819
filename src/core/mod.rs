pub mod connection;
pub mod hub;
pub mod protocol;

pub use connection::Connection;
pub use hub::Hub;
pub use protocol::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestId, ToolDescriptor};
