//! Default configuration values.
//!
//! Single source of truth for every tunable the engine reads. The serde
//! defaults and the `Default` impls in `structs` both go through here.

// Rule defaults
pub const ALLOW_BIKJANG: bool = false;
pub const BOARD_BASED_REPETITIVE_MOVE: bool = false;
pub const JANG_MOVE_IS_ILLEGAL: bool = false;

// Search defaults
pub const NUM_THREADS: usize = 12;
pub const SEARCH_NUM: u32 = 10_000;
pub const SEARCH_TIME_MS: u64 = 10_000;
pub const PRINT_PERIOD_MS: u64 = 2_500;
pub const SCORE_BASED_BIAS_RATE: f32 = 0.0;

// Inference defaults
pub const BATCH_SIZE: usize = 12;
pub const CACHE_SIZE: usize = 20_000;
// 0 means "derive from batch size and device count"
pub const NUM_SCHEDULER_THREADS: usize = 0;

// Display defaults
pub const FLIP_DISPLAY: bool = false;
pub const VERBOSE: bool = true;

pub fn allow_bikjang() -> bool {
    ALLOW_BIKJANG
}
pub fn board_based_repetitive_move() -> bool {
    BOARD_BASED_REPETITIVE_MOVE
}
pub fn jang_move_is_illegal() -> bool {
    JANG_MOVE_IS_ILLEGAL
}
pub fn num_threads() -> usize {
    NUM_THREADS
}
pub fn search_num() -> u32 {
    SEARCH_NUM
}
pub fn search_time_ms() -> u64 {
    SEARCH_TIME_MS
}
pub fn print_period_ms() -> u64 {
    PRINT_PERIOD_MS
}
pub fn score_based_bias_rate() -> f32 {
    SCORE_BASED_BIAS_RATE
}
pub fn batch_size() -> usize {
    BATCH_SIZE
}
pub fn cache_size() -> usize {
    CACHE_SIZE
}
pub fn num_scheduler_threads() -> usize {
    NUM_SCHEDULER_THREADS
}
pub fn flip_display() -> bool {
    FLIP_DISPLAY
}
pub fn verbose() -> bool {
    VERBOSE
}
