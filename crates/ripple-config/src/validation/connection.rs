//! Validation for transports, identity, and endpoint settings.

use std::collections::HashSet;

use crate::schema::{ClientOptions, KNOWN_TRANSPORTS};

use super::helpers::validate_range;

/// Transport list must be non-empty, known, and free of duplicates.
pub(crate) fn validate_transports(errors: &mut Vec<String>, options: &ClientOptions) {
    if options.transports.is_empty() {
        errors.push("transports must name at least one transport".into());
    }

    let mut seen = HashSet::new();
    for name in &options.transports {
        if !KNOWN_TRANSPORTS.contains(&name.as_str()) {
            errors.push(format!("transports: unknown transport '{name}'"));
        }
        if !seen.insert(name.as_str()) {
            errors.push(format!("transports: '{name}' listed more than once"));
        }
    }

    validate_range(
        errors,
        "max_message_size",
        u64::from(options.max_message_size),
        1,
        16 * 1024 * 1024,
    );
}

/// `*` is reserved for wildcard tokens and cannot identify a client.
pub(crate) fn validate_identity(errors: &mut Vec<String>, options: &ClientOptions) {
    match options.client_id.as_deref() {
        Some("") => errors.push("client_id must not be empty".into()),
        Some("*") => errors.push("client_id '*' is reserved".into()),
        _ => {}
    }
}

pub(crate) fn validate_endpoint(errors: &mut Vec<String>, options: &ClientOptions) {
    if options.endpoint.host.trim().is_empty() {
        errors.push("endpoint.host must not be empty".into());
    }
    if options.endpoint.port == 0 {
        errors.push("endpoint.port must not be 0".into());
    }
}
