//! Configuration loading logic.
//!
//! Handles loading config from files and applying environment variable
//! overrides.

use crate::EngineConfig;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Standard locations to search for config.toml
pub const CONFIG_SEARCH_PATHS: &[&str] = &[
    "config.toml",    // Current directory
    "../config.toml", // Parent directory (when running from subdirectory)
];

/// Load the engine configuration from config.toml.
///
/// Searches for config.toml in the following order:
/// 1. Path specified by the JANGGI_CONFIG environment variable
/// 2. Current directory (config.toml)
/// 3. Parent directory (../config.toml)
///
/// After loading, environment variable overrides are applied.
pub fn load_config() -> EngineConfig {
    if let Ok(path) = std::env::var("JANGGI_CONFIG") {
        let path = PathBuf::from(&path);
        if path.exists() {
            info!("Loading config from JANGGI_CONFIG: {}", path.display());
            return load_from_path(&path);
        }
        warn!(
            "JANGGI_CONFIG={} not found, searching defaults",
            path.display()
        );
    }

    for path_str in CONFIG_SEARCH_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading config from {}", path.display());
            return load_from_path(&path);
        }
    }

    debug!("No config.toml found, using built-in defaults");
    apply_env_overrides(EngineConfig::default())
}

/// Load configuration from a specific path.
pub fn load_from_path(path: &PathBuf) -> EngineConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => apply_env_overrides(config),
            Err(e) => {
                warn!("Failed to parse {}: {}, using defaults", path.display(), e);
                apply_env_overrides(EngineConfig::default())
            }
        },
        Err(e) => {
            warn!("Failed to read {}: {}, using defaults", path.display(), e);
            apply_env_overrides(EngineConfig::default())
        }
    }
}

/// Macro to reduce env override boilerplate
macro_rules! env_override {
    // Parseable field (bool, usize, u64, f32, ...)
    ($config:expr, $section:ident . $field:ident, $key:expr) => {
        if let Ok(v) =
            std::env::var($key).and_then(|s| s.parse().map_err(|_| std::env::VarError::NotPresent))
        {
            $config.$section.$field = v;
        }
    };
}

/// Apply environment variable overrides to a configuration.
///
/// Environment variables follow the pattern: JANGGI_<SECTION>_<KEY>
pub fn apply_env_overrides(mut config: EngineConfig) -> EngineConfig {
    // Rules
    env_override!(config, rules.allow_bikjang, "JANGGI_RULES_ALLOW_BIKJANG");
    env_override!(
        config,
        rules.board_based_repetitive_move,
        "JANGGI_RULES_BOARD_BASED_REPETITIVE_MOVE"
    );
    env_override!(
        config,
        rules.jang_move_is_illegal,
        "JANGGI_RULES_JANG_MOVE_IS_ILLEGAL"
    );

    // Search
    env_override!(config, search.num_threads, "JANGGI_SEARCH_NUM_THREADS");
    env_override!(config, search.search_num, "JANGGI_SEARCH_SEARCH_NUM");
    env_override!(
        config,
        search.search_time_ms,
        "JANGGI_SEARCH_SEARCH_TIME_MS"
    );
    env_override!(
        config,
        search.print_period_ms,
        "JANGGI_SEARCH_PRINT_PERIOD_MS"
    );
    env_override!(
        config,
        search.score_based_bias_rate,
        "JANGGI_SEARCH_SCORE_BASED_BIAS_RATE"
    );

    // Inference
    env_override!(config, inference.batch_size, "JANGGI_INFERENCE_BATCH_SIZE");
    env_override!(config, inference.cache_size, "JANGGI_INFERENCE_CACHE_SIZE");
    env_override!(
        config,
        inference.num_scheduler_threads,
        "JANGGI_INFERENCE_NUM_SCHEDULER_THREADS"
    );

    // Display
    env_override!(config, display.flip_display, "JANGGI_DISPLAY_FLIP_DISPLAY");
    env_override!(config, display.verbose, "JANGGI_DISPLAY_VERBOSE");

    config
}
