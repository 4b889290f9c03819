//! MCP Hub: multiplexes WebSocket tool calls across stdio MCP servers

pub mod cache;
pub mod config;
pub mod core;
pub mod recovery;
pub mod server;
pub mod transport;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::Hub;
pub use crate::utils::errors::{HubError, HubResult};
