//! Full configuration validation.
//!
//! Each domain has its own submodule; this orchestrator calls them all
//! and collects errors into a single `ConfigError`.

mod connection;
mod helpers;
mod timeouts;

#[cfg(test)]
mod tests;

use crate::schema::ClientOptions;
use ripple_common::ConfigError;

/// Run all validations on the options, collecting all errors.
pub fn validate(options: &ClientOptions) -> Result<(), ConfigError> {
    let mut errors: Vec<String> = Vec::new();

    connection::validate_transports(&mut errors, options);
    connection::validate_identity(&mut errors, options);
    connection::validate_endpoint(&mut errors, options);
    timeouts::validate_timeouts(&mut errors, options);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationError(errors.join("; ")))
    }
}
