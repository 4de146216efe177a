use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("config parse error: {0}")]
    ParseError(String),

    #[error("config validation error: {0}")]
    ValidationError(String),
}

/// Failures building a client, before any connection exists.
#[derive(Debug, thiserror::Error)]
pub enum RippleError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The engine task could not take a command.
    #[error("engine error: {0}")]
    Engine(String),
}
