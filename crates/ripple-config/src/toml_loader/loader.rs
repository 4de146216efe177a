//! Core TOML config loading: parse from a string or a file path.

use crate::schema::ClientOptions;
use crate::validation;
use ripple_common::ConfigError;
use std::path::Path;
use tracing::info;

/// Parse options from TOML text, filling missing fields with defaults.
///
/// The parsed options are validated; any violation is returned as
/// `ConfigError::ValidationError`.
pub fn from_toml_str(content: &str) -> Result<ClientOptions, ConfigError> {
    let options: ClientOptions = toml::from_str(content)
        .map_err(|e| ConfigError::ParseError(format!("failed to parse TOML: {e}")))?;

    validation::validate(&options)?;
    Ok(options)
}

/// Load options from a specific TOML file path.
pub fn load_from_path(path: &Path) -> Result<ClientOptions, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::ParseError(format!("failed to read {}: {e}", path.display())))?;

    let options = from_toml_str(&content)?;
    info!("loaded client options from {}", path.display());
    Ok(options)
}
