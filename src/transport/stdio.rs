use crate::config::ConnectionConfig;
use crate::core::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::transport::line::LineTransport;
use crate::transport::traits::{Transport, TransportFactory};
use crate::utils::errors::{HubError, HubResult};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const CHILD_EXIT_WAIT: Duration = Duration::from_secs(5);

/// Stdio transport for MCP servers running as child processes
pub struct StdioTransport {
    name: String,
    child: Mutex<Child>,
    inner: LineTransport,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio.
    ///
    /// The child inherits the hub's environment plus the configured overrides.
    pub fn spawn(name: &str, config: &ConnectionConfig) -> HubResult<Self> {
        let spawn_error = |message: String| HubError::Spawn {
            command: config.command_line(),
            message,
        };

        let program = which::which(&config.command)
            .map_err(|e| spawn_error(format!("executable not found ({})", e)))?;
        debug!(connection = %name, "Resolved '{}' to {}", config.command, program.display());

        let mut child = Command::new(&program)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("Failed to open stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| spawn_error("Failed to open stdout".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(name.to_string(), stderr));
        }

        info!(connection = %name, pid = ?child.id(), "Spawned {}", config.command_line());

        Ok(Self {
            name: name.to_string(),
            child: Mutex::new(child),
            inner: LineTransport::new(name, stdout, stdin, config.request_timeout()),
        })
    }

    /// Fail if the child already exited, e.g. during its startup delay
    pub async fn ensure_running(&self) -> HubResult<()> {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => Err(HubError::Handshake {
                connection: self.name.clone(),
                message: format!("process exited during startup ({})", status),
            }),
            Ok(None) => Ok(()),
            Err(e) => Err(HubError::Io(e)),
        }
    }
}

async fn forward_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(connection = %name, "stderr: {}", line);
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> HubResult<JsonRpcResponse> {
        self.inner.send_request(request).await
    }

    async fn send_notification(&self, request: JsonRpcRequest) -> HubResult<()> {
        self.inner.send_notification(request).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }

    async fn close(&self) -> HubResult<()> {
        self.inner.close().await?;

        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            debug!(connection = %self.name, "Kill signal not delivered: {}", e);
        }

        match tokio::time::timeout(CHILD_EXIT_WAIT, child.wait()).await {
            Ok(Ok(status)) => info!(connection = %self.name, "Child process exited with: {}", status),
            Ok(Err(e)) => error!(connection = %self.name, "Failed to wait for child: {}", e),
            Err(_) => warn!(connection = %self.name, "Timeout waiting for child process"),
        }
        Ok(())
    }
}

/// Spawns each connection as a child process, honoring its startup delay
#[derive(Debug, Default, Clone)]
pub struct StdioTransportFactory;

#[async_trait]
impl TransportFactory for StdioTransportFactory {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> HubResult<Box<dyn Transport>> {
        let transport = StdioTransport::spawn(name, config)?;

        let delay = config.startup_delay();
        if !delay.is_zero() {
            debug!(connection = %name, "Waiting {:?} for startup", delay);
            tokio::time::sleep(delay).await;
        }
        if let Err(e) = transport.ensure_running().await {
            let _ = transport.close().await;
            return Err(e);
        }

        Ok(Box::new(transport))
    }
}
