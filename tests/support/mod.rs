//! In-process MCP servers speaking newline-delimited JSON-RPC over a duplex pipe

#![allow(dead_code)]

use async_trait::async_trait;
use mcp_hub::config::{ConnectionConfig, DuplicatePolicy};
use mcp_hub::core::Hub;
use mcp_hub::transport::{LineTransport, Transport, TransportFactory};
use mcp_hub::{HubError, HubResult};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::{JoinHandle, JoinSet};

pub type Handler = Arc<dyn Fn(&str, &Value) -> Result<Value, String> + Send + Sync>;

/// A scripted MCP server. Clones share state.
#[derive(Clone)]
pub struct FakeServer {
    tools: Arc<Mutex<Vec<String>>>,
    handler: Handler,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl FakeServer {
    /// Answers every call with `"<tool> ok"`
    pub fn new(tools: &[&str]) -> Self {
        Self {
            tools: Arc::new(Mutex::new(tools.iter().map(|t| t.to_string()).collect())),
            handler: Arc::new(|tool, _| Ok(json!(format!("{} ok", tool)))),
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// `Ok(String)` is wrapped in a text content block, other values are
    /// returned as the raw result, `Err` becomes a JSON-RPC error.
    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handler = Arc::new(handler);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of tools/call requests received
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.tools.lock() = tools.iter().map(|t| t.to_string()).collect();
    }

    /// Simulate the process dying: the pipe closes and in-flight calls never answer
    pub fn kill(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn attach(&self, stream: DuplexStream) {
        let server = self.clone();
        let task = tokio::spawn(async move { server.serve(stream).await });
        *self.task.lock() = Some(task);
    }

    async fn serve(self, stream: DuplexStream) {
        let (read, write) = tokio::io::split(stream);
        let writer = Arc::new(tokio::sync::Mutex::new(write));
        let mut lines = BufReader::new(read).lines();
        let mut in_flight = JoinSet::new();

        while let Ok(Some(line)) = lines.next_line().await {
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            let Some(id) = message.get("id").cloned() else {
                continue;
            };

            let server = self.clone();
            let writer = writer.clone();
            in_flight.spawn(async move {
                let reply = match server.respond(&message).await {
                    Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
                    Err(message) => json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {"code": -32000, "message": message}
                    }),
                };
                let mut writer = writer.lock().await;
                let _ = writer.write_all(format!("{}\n", reply).as_bytes()).await;
                let _ = writer.flush().await;
            });
        }
    }

    async fn respond(&self, message: &Value) -> Result<Value, String> {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        match message["method"].as_str().unwrap_or_default() {
            "initialize" => Ok(json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "fake", "version": "0.0.0"}
            })),
            "tools/list" => {
                let tools: Vec<Value> = self
                    .tools
                    .lock()
                    .iter()
                    .map(|name| {
                        json!({
                            "name": name,
                            "description": format!("{} tool", name),
                            "inputSchema": {"type": "object"}
                        })
                    })
                    .collect();
                Ok(json!({ "tools": tools }))
            }
            "tools/call" => {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
                match (self.handler)(&tool, &arguments)? {
                    Value::String(text) => Ok(json!({"content": [{"type": "text", "text": text}]})),
                    other => Ok(other),
                }
            }
            other => Err(format!("Method not found: {}", other)),
        }
    }
}

/// Connects configured names to fake servers; unknown names fail to spawn
#[derive(Default)]
pub struct FakeFactory {
    servers: HashMap<String, FakeServer>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, server: FakeServer) -> Self {
        self.servers.insert(name.to_string(), server);
        self
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn connect(&self, name: &str, config: &ConnectionConfig) -> HubResult<Box<dyn Transport>> {
        let server = self.servers.get(name).ok_or_else(|| HubError::Spawn {
            command: config.command.clone(),
            message: "No such file or directory".to_string(),
        })?;

        let (client, remote) = tokio::io::duplex(64 * 1024);
        server.attach(remote);
        let (reader, writer) = tokio::io::split(client);
        Ok(Box::new(LineTransport::new(
            name,
            reader,
            writer,
            config.request_timeout(),
        )))
    }
}

pub fn connection(name: &str) -> ConnectionConfig {
    ConnectionConfig::new(name, format!("{}-mcp", name), vec![])
}

/// Start a first-wins hub over the given fake servers, in order
pub async fn start_hub(servers: &[(&str, &FakeServer)]) -> Arc<Hub> {
    start_hub_with(DuplicatePolicy::FirstWins, servers).await
}

pub async fn start_hub_with(policy: DuplicatePolicy, servers: &[(&str, &FakeServer)]) -> Arc<Hub> {
    let factory = servers
        .iter()
        .fold(FakeFactory::new(), |factory, (name, server)| {
            factory.with(name, (*server).clone())
        });
    let configs: Vec<ConnectionConfig> = servers.iter().map(|(name, _)| connection(name)).collect();

    let hub = Arc::new(Hub::new(policy));
    hub.start(&configs, &factory).await;
    hub
}

/// Poll until `check` holds or a second passes
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
