//! Forced-win tactical search.
//!
//! An iteratively deepened alpha-beta-like search over piece-only moves: a
//! side "can win" if some move captures the enemy General outright or forces
//! a position where every reply still loses. Non-checking moves cost an
//! extra point of depth, so forcing sequences are searched deeper than quiet
//! ones.
//!
//! This search exists for analysis; the tree search never consults it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::board::Board;
use crate::moves::Move;
use crate::types::is_general;

impl Board {
    /// Look for a forced General capture within `max_depth` plies, giving up
    /// after `timeout_ms`. Returns the winning sequence, or an empty vector
    /// when none was found in time.
    ///
    /// Depth is iterated from 1 upward so the first hit is (close to) the
    /// shortest forcing line. A timer thread flips the shared timeout flag;
    /// once set, in-flight iterations collapse to depth 1 and return what
    /// they have.
    pub fn can_win(&mut self, max_depth: i32, timeout_ms: u64) -> Vec<Move> {
        let timeout = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));

        let timer = {
            let timeout = Arc::clone(&timeout);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut waited = 0u64;
                while !done.load(Ordering::Relaxed) && waited < timeout_ms {
                    thread::sleep(Duration::from_millis(1));
                    waited += 1;
                }
                timeout.store(true, Ordering::Relaxed);
            })
        };

        let mut ret = Vec::new();
        for depth in 1..=max_depth {
            if timeout.load(Ordering::Relaxed) {
                break;
            }
            let seq = self.can_win_at(depth, &timeout);
            if !seq.is_empty() {
                debug!(depth, len = seq.len(), "forced win found");
                ret = seq;
                break;
            }
        }

        done.store(true, Ordering::Relaxed);
        let _ = timer.join();
        ret
    }

    fn can_win_at(&mut self, mut depth: i32, timeout: &AtomicBool) -> Vec<Move> {
        if depth > 2 && timeout.load(Ordering::Relaxed) {
            depth = 1;
        }
        if depth <= 0 {
            return Vec::new();
        }
        if self.winner_piece_only().is_some() {
            // Already decided; nothing to search for.
            return Vec::new();
        }

        let mut ret: Vec<Move> = Vec::new();
        for m in self.raw_moves() {
            if !ret.is_empty() {
                break;
            }
            if !m.is_pass() && !is_general(m.piece) && is_general(m.captured) {
                // Immediate General capture; bikjang does not count.
                ret.push(m);
            } else if depth > 1 {
                self.apply_piece_move(&m);
                let v = self.must_lose_at(depth - 1, timeout);
                if !v.is_empty() {
                    ret.clear();
                    ret.reserve(v.len() + 1);
                    ret.push(m);
                    ret.extend(v);
                }
                self.undo_piece_move(&m);
            }
        }
        ret
    }

    /// Non-empty iff every reply of the side to move runs back into a
    /// winning line for the opponent; returns the longest such losing
    /// sequence found.
    fn must_lose_at(&mut self, mut depth: i32, timeout: &AtomicBool) -> Vec<Move> {
        if depth <= 0 {
            return Vec::new();
        }
        if self.winner_piece_only().is_some() {
            return Vec::new();
        }

        // Piece-only moves skip the caches, so probe check directly.
        let in_check = self.opponent_threatens_general();
        if !in_check {
            depth -= 1;
        }
        if depth <= 0 {
            return Vec::new();
        }

        let mut best: Vec<Move> = Vec::new();
        for m in self.raw_moves() {
            self.apply_piece_move(&m);
            let v = self.can_win_at(depth, timeout);
            self.undo_piece_move(&m);

            if v.is_empty() {
                // One reply escapes; the position is not lost.
                return Vec::new();
            }
            if best.len() <= v.len() {
                best.clear();
                best.reserve(v.len() + 1);
                best.push(m);
                best.extend(v);
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use engine_config::RulesConfig;

    use crate::board::Board;
    use crate::types::{Side, StartLayout};

    #[test]
    fn finds_hanging_general_at_depth_one() {
        // A Cho chariot two empty squares below the Han General.
        let mut board = Board::from_position(
            &[(84, 0x00), (14, 0x10), (34, 0x03)],
            Side::Cho,
            RulesConfig::default(),
        );

        let seq = board.can_win(1, 10_000);
        assert_eq!(seq.len(), 1);
        assert_eq!(seq[0].from, 34);
        assert_eq!(seq[0].to, 14);
    }

    #[test]
    fn finds_forced_mate_in_two() {
        // Han to move: the rank chariot checks from the diagonal post 75,
        // its partner on 93 covers every flight square, so any Cho reply
        // hangs the General.
        let mut board = Board::from_position(
            &[(85, 0x00), (14, 0x10), (93, 0x13), (70, 0x14)],
            Side::Han,
            RulesConfig::default(),
        );

        let seq = board.can_win(3, 10_000);
        assert_eq!(seq.len(), 3);
        assert_eq!(seq[0].from, 70);
        assert_eq!(seq[0].to, 75);

        // The search restores the board it borrowed.
        assert_eq!(board.to_move(), Side::Han);
        assert_eq!(board.movenum(), 0);
    }

    #[test]
    fn opening_has_no_forced_win() {
        let mut board =
            Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default());
        assert!(board.can_win(2, 10_000).is_empty());
    }

    #[test]
    fn expired_timeout_still_returns() {
        let mut board =
            Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default());
        // A zero budget trips the timer immediately; the search must come
        // back empty-handed rather than hang.
        let seq = board.can_win(30, 0);
        assert!(seq.is_empty());
    }
}
