//! Centralized configuration loading from config.toml.
//!
//! This crate provides configuration structs and loading logic shared
//! across the engine crates.
//!
//! # Configuration Priority
//!
//! Settings are loaded with the following priority (highest to lowest):
//! 1. Environment variables (`JANGGI_<SECTION>_<KEY>`)
//! 2. config.toml file
//! 3. Built-in defaults
//!
//! # Environment Variable Override Pattern
//!
//! ```text
//! JANGGI_<SECTION>_<KEY>=value
//!
//! Examples:
//!     JANGGI_RULES_ALLOW_BIKJANG=true
//!     JANGGI_SEARCH_NUM_THREADS=24
//!     JANGGI_INFERENCE_BATCH_SIZE=32
//! ```
//!
//! Long-running operations take a snapshot of the section they need
//! (`RulesConfig`, `SearchConfig`, `InferenceConfig` are all `Copy`); nothing
//! reads configuration mid-search.

mod defaults;
mod loader;
mod structs;

pub use defaults::*;
pub use loader::{apply_env_overrides, load_config, load_from_path, CONFIG_SEARCH_PATHS};
pub use structs::*;

#[cfg(test)]
mod tests;
