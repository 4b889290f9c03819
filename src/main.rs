use anyhow::Context;
use clap::{Args, Parser};
use mcp_hub::cache::ResultCache;
use mcp_hub::config::{default_config_path, Config, ConfigManager, ConfigValidator, LogFormat};
use mcp_hub::core::Hub;
use mcp_hub::recovery::{ErrorClassifier, RetryManager};
use mcp_hub::server::{Dispatcher, RelayServer, SafetyGate};
use mcp_hub::transport::StdioTransportFactory;
use mcp_hub::utils::{init_tracing, ShutdownCoordinator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "mcp-hub")]
#[command(about = "Multiplex WebSocket tool calls across stdio MCP servers")]
#[command(version)]
enum Cli {
    /// Start the hub and the WebSocket relay
    Serve(ServeArgs),
    /// Validate a configuration file and list its connections
    Check(ConfigArgs),
    /// Print the configuration JSON Schema
    Schema,
}

#[derive(Args)]
struct ConfigArgs {
    /// Configuration file path (JSON, YAML or TOML)
    #[arg(short, long, env = "MCP_HUB_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Args)]
struct ServeArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,
    /// Port to bind to
    #[arg(short, long)]
    port: Option<u16>,
    /// Log level
    #[arg(short, long)]
    log_level: Option<String>,
    /// Log format (pretty or json)
    #[arg(long)]
    log_format: Option<LogFormat>,
}

async fn load_config(args: &ConfigArgs) -> anyhow::Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => {
            let path = default_config_path();
            if !path.exists() {
                eprintln!(
                    "No config at {}, starting without connections",
                    path.display()
                );
                return Ok(Config::default());
            }
            path
        }
    };

    let manager = ConfigManager::load(&path)
        .await
        .with_context(|| format!("loading {}", path.display()))?;
    let config = manager.into_config();

    if let Err(errors) = ConfigValidator::new().validate(&config) {
        for e in &errors {
            eprintln!("  {}", e);
        }
        anyhow::bail!("{} configuration error(s) in {}", errors.len(), path.display());
    }
    Ok(config)
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config).await?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }

    init_tracing(&config.logging);
    info!("Starting MCP Hub v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();

    let hub = Arc::new(Hub::new(config.hub.duplicate_tools));
    hub.start(&config.connections, &StdioTransportFactory).await;
    if hub.connection_names().is_empty() && !config.connections.is_empty() {
        warn!("No connections started; every tool call will fail until a reload succeeds");
    }

    let cache = config.cache.enabled.then(|| {
        let cache = Arc::new(ResultCache::new(&config.cache));
        cache.spawn_sweeper(
            Duration::from_secs(config.cache.sweep_interval_secs),
            shutdown.clone(),
        );
        cache
    });
    let retry = config.retry.enabled.then(|| {
        let retry = Arc::new(RetryManager::new(ErrorClassifier::new(), &config.retry));
        retry.spawn_sweeper(
            Duration::from_secs(config.relay.sweep_interval_secs),
            shutdown.clone(),
        );
        retry
    });

    let safety = Arc::new(SafetyGate::new(&config.safety));
    let dispatcher = Arc::new(Dispatcher::new(hub.clone(), cache, retry).with_safety(safety));
    let relay = RelayServer::new(dispatcher, &config.relay);

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_shutdown_signal().await });

    let result = relay
        .run(&config.server.host, config.server.port, shutdown.clone())
        .await;
    if let Err(e) = &result {
        error!("Relay stopped with error: {}", e);
        shutdown.shutdown();
    }

    hub.stop().await;
    info!("Shutdown complete");
    result.map_err(Into::into)
}

async fn check(args: ConfigArgs) -> anyhow::Result<()> {
    let config = load_config(&args).await?;
    println!("Configuration OK");
    println!(
        "Relay: ws://{}:{}",
        config.server.host, config.server.port
    );
    for connection in &config.connections {
        let state = if connection.disabled { " (disabled)" } else { "" };
        println!(
            "  {}: {}{}",
            connection.name,
            connection.command_line(),
            state
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::Serve(args) => serve(args).await,
        Cli::Check(args) => check(args).await,
        Cli::Schema => {
            println!("{}", ConfigValidator::new().export_schema());
            Ok(())
        }
    }
}
