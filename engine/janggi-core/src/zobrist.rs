//! Zobrist hashing constants.
//!
//! One 64-bit key per (square, piece code) pair, generated from a fixed-seed
//! ChaCha stream so hashes are reproducible across runs and platforms. The
//! position hash is the XOR of keys over occupied squares; the play hash
//! reuses the same table through a ply-dependent salted index (see
//! `Board::play`).

use once_cell::sync::Lazy;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::{BOARD_H, BOARD_W};

/// 32 piece-code slots per square covers both sides' codes with room to
/// spare; the salted play-hash index wraps over the whole table.
pub const TABLE_LEN: usize = BOARD_W * BOARD_H * 32;

pub struct ZobristTable {
    keys: Vec<u64>,
}

impl ZobristTable {
    fn new() -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(0x6a61_6e67_6769_2121);
        let keys = (0..TABLE_LEN).map(|_| rng.gen()).collect();
        Self { keys }
    }

    /// Key for a piece code sitting on (y, x).
    #[inline]
    pub fn key(&self, y: usize, x: usize, code: u8) -> u64 {
        self.keys[(y * BOARD_W + x) * 32 + code as usize]
    }

    /// Ply-salted key used by the play hash: two boards with equal piece
    /// placement but reached at different plies draw different keys.
    #[inline]
    pub fn salted_key(&self, y: usize, x: usize, code: u8, ply: usize) -> u64 {
        let index = (y * BOARD_W + x) * 32 + code as usize + 37 * (1 + ply);
        self.keys[index % TABLE_LEN]
    }
}

/// The process-wide key table.
pub fn zobrist() -> &'static ZobristTable {
    static TABLE: Lazy<ZobristTable> = Lazy::new(ZobristTable::new);
    &TABLE
}
