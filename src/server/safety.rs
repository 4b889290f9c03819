//! Safety checks in front of the dispatcher
//!
//! Path arguments must resolve inside one of the allowed directories, a
//! `command` argument is matched against the blocked and allowed lists, and
//! dangerous operations are held until a client approves them with a
//! `confirm_result` frame.

use crate::cache::result_cache::path_arguments;
use crate::config::{expand_path, SafetyConfig};
use crate::utils::errors::{HubError, HubResult};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

const REQUEST_BUFFER: usize = 64;

/// A dangerous operation waiting for a client's decision
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmationRequest {
    pub id: String,
    pub operation: String,
    pub params: Value,
}

pub struct SafetyGate {
    allowed_paths: Vec<PathBuf>,
    blocked_commands: Vec<String>,
    allowed_commands: Vec<String>,
    dangerous: HashSet<String>,
    require_confirmation: bool,
    confirmation_timeout: Duration,
    pending: DashMap<String, oneshot::Sender<bool>>,
    requests: broadcast::Sender<ConfirmationRequest>,
}

impl SafetyGate {
    pub fn new(config: &SafetyConfig) -> Self {
        let (requests, _) = broadcast::channel(REQUEST_BUFFER);
        Self {
            allowed_paths: config
                .allowed_paths
                .iter()
                .map(|path| normalize(Path::new(&expand_path(path))))
                .collect(),
            blocked_commands: config.blocked_commands.iter().map(|c| c.to_lowercase()).collect(),
            allowed_commands: config.allowed_commands.iter().map(|c| c.to_lowercase()).collect(),
            dangerous: config.dangerous_operations.iter().cloned().collect(),
            require_confirmation: config.require_confirmation,
            confirmation_timeout: Duration::from_secs(config.confirmation_timeout_secs),
            pending: DashMap::new(),
            requests,
        }
    }

    /// Receive confirmation requests as they are raised
    pub fn subscribe(&self) -> broadcast::Receiver<ConfirmationRequest> {
        self.requests.subscribe()
    }

    pub fn pending_confirmations(&self) -> usize {
        self.pending.len()
    }

    pub fn check_path(&self, path: &str) -> HubResult<()> {
        if self.allowed_paths.is_empty() {
            return Ok(());
        }
        let resolved = normalize(Path::new(&expand_path(path)));
        if self.allowed_paths.iter().any(|allowed| resolved.starts_with(allowed)) {
            Ok(())
        } else {
            Err(HubError::Denied(format!(
                "path outside allowed directories: {}",
                resolved.display()
            )))
        }
    }

    pub fn check_command(&self, command: &str) -> HubResult<()> {
        let command = command.trim().to_lowercase();

        if let Some(blocked) = self.blocked_commands.iter().find(|b| command.contains(b.as_str())) {
            return Err(HubError::Denied(format!("command matches blocked pattern '{}'", blocked)));
        }

        if self.allowed_commands.is_empty() {
            return Ok(());
        }
        let program = command.split_whitespace().next().unwrap_or_default();
        let allowed = self.allowed_commands.iter().any(|allowed| {
            program == allowed
                || program
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('/'))
        });
        if allowed {
            Ok(())
        } else {
            Err(HubError::Denied(format!("command '{}' is not in the allow-list", program)))
        }
    }

    pub fn requires_confirmation(&self, tool: &str) -> bool {
        self.require_confirmation && self.dangerous.contains(tool)
    }

    /// Run every check for one call, waiting for approval when required
    pub async fn check(&self, tool: &str, params: &Value) -> HubResult<()> {
        for path in path_arguments(params) {
            self.check_path(&path.to_string_lossy())?;
        }
        if let Some(command) = params.get("command").and_then(Value::as_str) {
            self.check_command(command)?;
        }
        if self.requires_confirmation(tool) {
            self.confirm(tool, params).await?;
        }
        Ok(())
    }

    async fn confirm(&self, tool: &str, params: &Value) -> HubResult<()> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);

        let request = ConfirmationRequest {
            id: id.clone(),
            operation: tool.to_string(),
            params: params.clone(),
        };
        if self.requests.send(request).is_err() {
            self.pending.remove(&id);
            return Err(HubError::Denied(format!(
                "{} requires confirmation and no client is connected",
                tool
            )));
        }
        info!(tool = %tool, id = %id, "Waiting for confirmation");

        match tokio::time::timeout(self.confirmation_timeout, rx).await {
            Ok(Ok(true)) => {
                debug!(tool = %tool, id = %id, "Operation approved");
                Ok(())
            }
            Ok(Ok(false)) => Err(HubError::Denied(format!("{} was rejected by the user", tool))),
            Ok(Err(_)) => Err(HubError::Denied(format!("confirmation for {} was abandoned", tool))),
            Err(_) => {
                self.pending.remove(&id);
                warn!(tool = %tool, id = %id, "No confirmation received");
                Err(HubError::Denied(format!(
                    "no confirmation for {} within {}s",
                    tool,
                    self.confirmation_timeout.as_secs()
                )))
            }
        }
    }

    /// Deliver a client's decision. False when nothing is waiting under `id`.
    pub fn resolve(&self, id: &str, approved: bool) -> bool {
        match self.pending.remove(id) {
            Some((_, tx)) => {
                info!(id = %id, approved, "Confirmation received");
                tx.send(approved).is_ok()
            }
            None => {
                warn!(id = %id, "No pending confirmation");
                false
            }
        }
    }

    /// Give up on a request nobody can answer
    pub fn abandon(&self, id: &str) {
        self.pending.remove(id);
    }
}

/// Absolute form of `path` with `.` and `..` folded away, without touching the filesystem
fn normalize(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
