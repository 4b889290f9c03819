//! Configuration validation

use crate::config::Config;
use schemars::schema_for;
use serde_json::Value;
use validator::{Validate, ValidationErrors, ValidationErrorsKind};

/// Validation error
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Configuration validator
pub struct ConfigValidator {
    schema: Value,
}

impl ConfigValidator {
    /// Create a new validator with the generated schema
    pub fn new() -> Self {
        let schema = schema_for!(Config);
        Self {
            schema: serde_json::to_value(&schema).unwrap_or_default(),
        }
    }

    /// Get the JSON Schema for the configuration
    pub fn get_schema(&self) -> &Value {
        &self.schema
    }

    /// Export the schema to a JSON string
    pub fn export_schema(&self) -> String {
        serde_json::to_string_pretty(&self.schema).unwrap_or_default()
    }

    /// Validate a parsed configuration
    pub fn validate(&self, config: &Config) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(validation_errors) = config.validate() {
            collect_errors("", &validation_errors, &mut errors);
        }

        self.validate_connections(config, &mut errors);

        if config.server.host.trim().is_empty() {
            errors.push(ValidationError {
                path: "server.host".to_string(),
                message: "Host cannot be empty".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_connections(&self, config: &Config, errors: &mut Vec<ValidationError>) {
        for connection in &config.connections {
            if connection.name.trim().is_empty() {
                errors.push(ValidationError {
                    path: "mcpServers".to_string(),
                    message: "Connection name cannot be empty".to_string(),
                });
            }
        }

        if !config.connections.is_empty() && config.connections.iter().all(|c| c.disabled) {
            errors.push(ValidationError {
                path: "mcpServers".to_string(),
                message: "All connections are disabled".to_string(),
            });
        }
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn collect_errors(prefix: &str, source: &ValidationErrors, out: &mut Vec<ValidationError>) {
    for (field, kind) in source.errors() {
        let path = if prefix.is_empty() {
            field.to_string()
        } else {
            format!("{}.{}", prefix, field)
        };
        match kind {
            ValidationErrorsKind::Field(field_errors) => {
                for error in field_errors {
                    let message = error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed '{}' check", error.code));
                    out.push(ValidationError {
                        path: path.clone(),
                        message,
                    });
                }
            }
            ValidationErrorsKind::Struct(nested) => collect_errors(&path, nested, out),
            ValidationErrorsKind::List(items) => {
                for (idx, nested) in items {
                    collect_errors(&format!("{}[{}]", path, idx), nested, out);
                }
            }
        }
    }
}
