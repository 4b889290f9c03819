pub mod manager;
pub mod types;
pub mod validation;

pub use manager::{default_config_path, expand_path, ConfigFormat, ConfigManager};
pub use types::*;
pub use validation::ConfigValidator;
