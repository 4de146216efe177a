//! TOML config loading.

mod loader;

#[cfg(test)]
mod tests;

pub use loader::{from_toml_str, load_from_path};
