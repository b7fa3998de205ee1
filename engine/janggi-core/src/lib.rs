//! Janggi (Korean chess) board representation and rules.
//!
//! The board is a 9x10 grid with two 3x3 palaces. Seven piece types move
//! under palace-diagonal exceptions; terminality folds in checkmate,
//! two repetition-rule variants, material endings and pass-out endings.
//!
//! The crate exposes:
//!
//! - [`Board`]: game state with make/unmake, incremental Zobrist hashing,
//!   cached legal moves and material scores, and the full win predicate.
//! - [`Move`]: a from/to/piece/captured quadruple with the 1-indexed
//!   `RC-RC` text form used by the console layer.
//! - [`Board::can_win`]: an iteratively deepened forced-win search used for
//!   analysis.
//!
//! Rule variants (bikjang, repetition flavor, check-exposing legality) are
//! snapshotted into each board from [`engine_config::RulesConfig`]; nothing
//! reads process-wide state mid-game.

mod board;
mod movegen;
mod moves;
mod tactics;
mod types;
mod zobrist;

#[cfg(test)]
mod board_tests;

pub use board::{Board, BoardError};
pub use moves::Move;
pub use types::{piece_kind, piece_side, piece_value, PieceKind, Side, StartLayout, EMPTY};
pub use zobrist::{zobrist, ZobristTable};

/// Board width in files.
pub const BOARD_W: usize = 9;
/// Board height in ranks.
pub const BOARD_H: usize = 10;
/// Playable intersections.
pub const NUM_INTERSECTIONS: usize = BOARD_W * BOARD_H;
