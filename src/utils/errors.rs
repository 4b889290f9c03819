use thiserror::Error;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("failed to spawn '{command}': {message}")]
    Spawn { command: String, message: String },

    #[error("handshake with '{connection}' failed: {message}")]
    Handshake { connection: String, message: String },

    #[error("request timed out after {0}ms")]
    Timeout(u64),

    #[error("connection lost: '{0}' process exited")]
    ConnectionLost(String),

    #[error("{0}")]
    Remote(String),

    #[error("tool not found: {0}")]
    CapabilityNotFound(String),

    #[error("tool '{tool}' from '{connection}' is already provided by '{owner}'")]
    DuplicateCapability {
        tool: String,
        connection: String,
        owner: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation not permitted: {0}")]
    Denied(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<anyhow::Error> for HubError {
    fn from(e: anyhow::Error) -> Self {
        HubError::Internal(e.to_string())
    }
}

impl HubError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Spawn { .. } => "SPAWN_ERROR",
            Self::Handshake { .. } => "HANDSHAKE_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConnectionLost(_) => "CONNECTION_LOST",
            Self::Remote(_) => "REMOTE_ERROR",
            Self::CapabilityNotFound(_) => "CAPABILITY_NOT_FOUND",
            Self::DuplicateCapability { .. } => "DUPLICATE_CAPABILITY",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Denied(_) => "DENIED",
            Self::Internal(_) => "INTERNAL_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// True when the owning child process went away while the request was pending.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::ConnectionLost(_))
    }
}

pub type HubResult<T> = Result<T, HubError>;
