use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use validator::Validate;

/// Tools whose results depend only on their arguments and are safe to cache.
pub const DEFAULT_CACHEABLE_TOOLS: &[&str] = &[
    "read_file",
    "read_text_file",
    "read_multiple_files",
    "list_directory",
    "list_directory_with_sizes",
    "directory_tree",
    "get_file_info",
    "search_files",
    "list_allowed_directories",
    "get_symbols",
    "get_ast",
    "find_text",
    "list_projects_tool",
    "list_languages",
    "get_dependencies",
];

/// Per-tool TTL overrides, in seconds.
pub const DEFAULT_TOOL_TTL_SECS: &[(&str, u64)] = &[
    ("read_file", 60),
    ("list_directory", 30),
    ("directory_tree", 60),
    ("get_file_info", 30),
    ("search_files", 20),
    ("get_symbols", 120),
    ("get_ast", 120),
    ("list_projects_tool", 300),
];

/// Tools whose success changes what cached reads would return.
pub const DEFAULT_INVALIDATING_TOOLS: &[&str] =
    &["write_file", "edit_file", "create_directory", "move_file"];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, Default)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Downstream MCP servers, in startup order
    #[serde(
        default,
        rename = "mcpServers",
        alias = "mcp_servers",
        with = "connection_map"
    )]
    #[schemars(with = "BTreeMap<String, ConnectionConfig>")]
    #[validate(nested)]
    pub connections: Vec<ConnectionConfig>,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    #[validate(nested)]
    pub cache: CacheConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    #[serde(default)]
    #[validate(nested)]
    pub relay: RelayConfig,
    #[serde(default)]
    #[validate(nested)]
    pub safety: SafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    #[validate(range(min = 1, message = "port must be non-zero"))]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            _ => Err(format!("Unknown log format: {}", s)),
        }
    }
}

/// Launch spec for one downstream MCP server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate, PartialEq)]
pub struct ConnectionConfig {
    /// Filled from the `mcpServers` key
    #[serde(skip)]
    pub name: String,
    /// Executable to run (resolved through PATH)
    #[validate(length(min = 1, message = "command must not be empty"))]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Settling delay between spawn and handshake
    #[serde(default, alias = "startupTimeout")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_request_timeout_ms", alias = "requestTimeout")]
    #[validate(range(min = 1, message = "request timeout must be positive"))]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub disabled: bool,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl ConnectionConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            env: HashMap::new(),
            startup_delay_ms: 0,
            request_timeout_ms: default_request_timeout_ms(),
            disabled: false,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// Command line as shown in logs
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.command.clone()
        } else {
            format!("{} {}", self.command, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(default)]
pub struct HubConfig {
    pub duplicate_tools: DuplicatePolicy,
}

/// What to do when two connections advertise the same tool name
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Earliest registered connection keeps the name; later ones are shadowed
    #[default]
    FirstWins,
    /// A connection advertising an already-registered name is refused
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[validate(range(min = 1))]
    pub default_ttl_secs: u64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
    pub cacheable_tools: Vec<String>,
    pub tool_ttl_secs: HashMap<String, u64>,
    pub invalidating_tools: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 30,
            sweep_interval_secs: 60,
            cacheable_tools: DEFAULT_CACHEABLE_TOOLS.iter().map(|s| s.to_string()).collect(),
            tool_ttl_secs: DEFAULT_TOOL_TTL_SECS
                .iter()
                .map(|(tool, secs)| (tool.to_string(), *secs))
                .collect(),
            invalidating_tools: DEFAULT_INVALIDATING_TOOLS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts per call, the first one included
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    #[validate(range(min = 1))]
    pub state_ttl_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            state_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct RelayConfig {
    #[validate(range(min = 1))]
    pub dedup_window_secs: u64,
    #[validate(range(min = 1))]
    pub caller_ttl_secs: u64,
    #[validate(range(min = 1))]
    pub sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 30,
            caller_ttl_secs: 300,
            sweep_interval_secs: 30,
        }
    }
}

/// Checks applied to every tool call before it is dispatched
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
#[serde(default)]
pub struct SafetyConfig {
    /// Directories path arguments must stay inside. Empty allows any path.
    pub allowed_paths: Vec<String>,
    /// Case-insensitive substrings that refuse a `command` argument
    pub blocked_commands: Vec<String>,
    /// When non-empty, the executables a `command` argument may start with
    pub allowed_commands: Vec<String>,
    pub require_confirmation: bool,
    /// Tools that wait for a client's `confirm_result` when confirmation is on
    pub dangerous_operations: Vec<String>,
    #[validate(range(min = 1))]
    pub confirmation_timeout_secs: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allowed_paths: Vec::new(),
            blocked_commands: Vec::new(),
            allowed_commands: Vec::new(),
            require_confirmation: false,
            dangerous_operations: Vec::new(),
            confirmation_timeout_secs: 60,
        }
    }
}

/// `mcpServers` is a JSON object keyed by connection name. Deserializing it
/// through a visitor keeps document order, which is startup order.
mod connection_map {
    use super::ConnectionConfig;
    use serde::de::{self, MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    #[allow(clippy::ptr_arg)]
    pub fn serialize<S: Serializer>(
        connections: &Vec<ConnectionConfig>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(connections.len()))?;
        for connection in connections {
            map.serialize_entry(&connection.name, connection)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<ConnectionConfig>, D::Error> {
        struct OrderedConnections;

        impl<'de> Visitor<'de> for OrderedConnections {
            type Value = Vec<ConnectionConfig>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of connection name to launch spec")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut connections: Vec<ConnectionConfig> = Vec::new();
                while let Some((name, mut connection)) =
                    access.next_entry::<String, ConnectionConfig>()?
                {
                    if connections.iter().any(|c| c.name == name) {
                        return Err(de::Error::custom(format!(
                            "duplicate connection name: {}",
                            name
                        )));
                    }
                    connection.name = name;
                    connections.push(connection);
                }
                Ok(connections)
            }
        }

        deserializer.deserialize_map(OrderedConnections)
    }
}
