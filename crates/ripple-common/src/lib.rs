//! Shared building blocks for the ripple realtime client crates.

pub mod errors;
pub mod events;
pub mod id;

pub use errors::{ConfigError, RippleError};
pub use events::EventBus;
pub use id::new_correlation_id;

pub type Result<T> = std::result::Result<T, RippleError>;
