use crate::config::Config;
use crate::utils::errors::{HubError, HubResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Supported config file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect format from file extension, falling back to content sniffing
    pub fn detect(path: &Path, content: &str) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ConfigFormat::Json,
            Some("yml") | Some("yaml") => ConfigFormat::Yaml,
            Some("toml") => ConfigFormat::Toml,
            _ => {
                let trimmed = content.trim_start();
                if trimmed.starts_with('{') {
                    ConfigFormat::Json
                } else if trimmed.starts_with('[') {
                    ConfigFormat::Toml
                } else {
                    ConfigFormat::Yaml
                }
            }
        }
    }
}

/// Loads the hub configuration once at startup
pub struct ConfigManager {
    path: PathBuf,
    format: ConfigFormat,
    config: Config,
}

impl ConfigManager {
    pub async fn load(path: impl AsRef<Path>) -> HubResult<Self> {
        let path = PathBuf::from(expand_path(&path.as_ref().to_string_lossy()));
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            HubError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;

        let format = ConfigFormat::detect(&path, &content);
        debug!("Detected config format: {:?}", format);

        let config = Self::parse_content(&content, format)?;
        info!(
            "Loaded config from {} ({} connections)",
            path.display(),
            config.connections.len()
        );

        Ok(Self {
            path,
            format,
            config,
        })
    }

    pub fn parse_content(content: &str, format: ConfigFormat) -> HubResult<Config> {
        match format {
            ConfigFormat::Json => serde_json::from_str(content)
                .map_err(|e| HubError::Config(format!("Failed to parse JSON config: {}", e))),
            ConfigFormat::Yaml => serde_yaml::from_str(content)
                .map_err(|e| HubError::Config(format!("Failed to parse YAML config: {}", e))),
            ConfigFormat::Toml => toml::from_str(content)
                .map_err(|e| HubError::Config(format!("Failed to parse TOML config: {}", e))),
        }
    }

    pub fn get_config(&self) -> Config {
        self.config.clone()
    }

    pub fn into_config(self) -> Config {
        self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ConfigFormat {
        self.format
    }
}

/// Default config location
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("mcp-hub/config.json"))
        .unwrap_or_else(|| PathBuf::from("~/.config/mcp-hub/config.json"))
}

/// Expand tilde in path
pub fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).to_string()
}
