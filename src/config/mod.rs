//! Application configuration
//!
//! Settings come from an optional TOML file. Every section falls back to its
//! defaults, so an empty or missing file is a valid configuration.

mod schema;

pub use schema::*;

use std::path::Path;

use tracing::info;

use crate::error::{AppError, Result};

/// Load and validate the configuration.
///
/// `None` yields the defaults.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                AppError::Config(format!("failed to read {}: {}", path.display(), e))
            })?;
            let config: AppConfig = toml::from_str(&text)
                .map_err(|e| AppError::Config(format!("{}: {}", path.display(), e)))?;
            info!("Configuration loaded from {}", path.display());
            config
        }
        None => AppConfig::default(),
    };
    config.validate()?;
    Ok(config)
}
