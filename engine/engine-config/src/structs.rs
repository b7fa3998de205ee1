//! Configuration struct definitions.
//!
//! All config structs with serde deserialization support and default values.

use crate::defaults;
use serde::Deserialize;

// ============================================================================
// Serde default functions (required for #[serde(default = "...")])
// These call the accessor functions from defaults module
// ============================================================================

fn d_allow_bikjang() -> bool {
    defaults::allow_bikjang()
}
fn d_board_based_repetitive_move() -> bool {
    defaults::board_based_repetitive_move()
}
fn d_jang_move_is_illegal() -> bool {
    defaults::jang_move_is_illegal()
}
fn d_num_threads() -> usize {
    defaults::num_threads()
}
fn d_search_num() -> u32 {
    defaults::search_num()
}
fn d_search_time_ms() -> u64 {
    defaults::search_time_ms()
}
fn d_print_period_ms() -> u64 {
    defaults::print_period_ms()
}
fn d_score_based_bias_rate() -> f32 {
    defaults::score_based_bias_rate()
}
fn d_batch_size() -> usize {
    defaults::batch_size()
}
fn d_cache_size() -> usize {
    defaults::cache_size()
}
fn d_num_scheduler_threads() -> usize {
    defaults::num_scheduler_threads()
}
fn d_flip_display() -> bool {
    defaults::flip_display()
}
fn d_verbose() -> bool {
    defaults::verbose()
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Root configuration structure matching config.toml
#[derive(Debug, Deserialize, Default, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

/// Game-rule variants.
///
/// These change what moves are legal and when a game terminates, so they are
/// snapshotted into each `Board` at construction rather than read globally.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(default)]
pub struct RulesConfig {
    /// Allow a General to call a face-off along an open file.
    #[serde(default = "d_allow_bikjang")]
    pub allow_bikjang: bool,
    /// Repetition detection compares whole positions instead of moves.
    #[serde(default = "d_board_based_repetitive_move")]
    pub board_based_repetitive_move: bool,
    /// Prune moves that leave the mover's General capturable.
    #[serde(default = "d_jang_move_is_illegal")]
    pub jang_move_is_illegal: bool,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            allow_bikjang: defaults::allow_bikjang(),
            board_based_repetitive_move: defaults::board_based_repetitive_move(),
            jang_move_is_illegal: defaults::jang_move_is_illegal(),
        }
    }
}

/// Tree-search configuration.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct SearchConfig {
    /// Parallel descents per search call.
    #[serde(default = "d_num_threads")]
    pub num_threads: usize,
    /// Visit cap per think.
    #[serde(default = "d_search_num")]
    pub search_num: u32,
    /// Deadline per think, in milliseconds.
    #[serde(default = "d_search_time_ms")]
    pub search_time_ms: u64,
    /// Milliseconds between winrate/PV reports while searching (0 disables).
    #[serde(default = "d_print_period_ms")]
    pub print_period_ms: u64,
    /// In [0, 1]: how much material score is mixed into fresh node values.
    #[serde(default = "d_score_based_bias_rate")]
    pub score_based_bias_rate: f32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            num_threads: defaults::num_threads(),
            search_num: defaults::search_num(),
            search_time_ms: defaults::search_time_ms(),
            print_period_ms: defaults::print_period_ms(),
            score_based_bias_rate: defaults::score_based_bias_rate(),
        }
    }
}

/// Neural-net evaluation configuration.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct InferenceConfig {
    /// Inference batch capacity. Changing it requires reloading the net.
    #[serde(default = "d_batch_size")]
    pub batch_size: usize,
    /// Per-bucket eval-cache threshold before generation rotation.
    #[serde(default = "d_cache_size")]
    pub cache_size: usize,
    /// Scheduler thread budget; 0 derives it from batch size and devices.
    #[serde(default = "d_num_scheduler_threads")]
    pub num_scheduler_threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::batch_size(),
            cache_size: defaults::cache_size(),
            num_scheduler_threads: defaults::num_scheduler_threads(),
        }
    }
}

/// Cosmetic output configuration.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct DisplayConfig {
    /// Render the board from Han's point of view.
    #[serde(default = "d_flip_display")]
    pub flip_display: bool,
    /// Gate diagnostic output.
    #[serde(default = "d_verbose")]
    pub verbose: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            flip_display: defaults::flip_display(),
            verbose: defaults::verbose(),
        }
    }
}
