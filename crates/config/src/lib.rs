//! Volley Config - YAML configuration loading and validation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod loader;

pub use loader::{ConfigError, Configuration};
