//! Ripple client configuration.
//!
//! Provides TOML-based configuration for the realtime client with full
//! validation. Every section uses sensible defaults so partial configs
//! work out of the box.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use ripple_config::{config_to_json, load_from_path};
//!
//! let options = load_from_path("ripple.toml".as_ref()).expect("failed to load config");
//! println!("{}", config_to_json(&options));
//! ```

pub mod schema;
pub mod toml_loader;
pub mod validation;

pub use schema::{ClientOptions, EndpointConfig, TimeoutConfig, KNOWN_TRANSPORTS};
pub use toml_loader::{from_toml_str, load_from_path};

/// Serialize options to a pretty-printed JSON string.
pub fn config_to_json(options: &ClientOptions) -> String {
    serde_json::to_string_pretty(options)
        .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize config: {e}\"}}"))
}
