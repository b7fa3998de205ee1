//! Game state: cells, hashes, history, scores, legal-move caches and the
//! terminality predicate.

use std::io::{self, Write};

use engine_config::RulesConfig;
use thiserror::Error;

use crate::movegen::RawGen;
use crate::moves::Move;
use crate::types::{is_general, piece_side, piece_value, Side, StartLayout, EMPTY};
use crate::zobrist::zobrist;
use crate::{BOARD_H, BOARD_W};

#[derive(Debug, Error)]
pub enum BoardError {
    #[error("invalid starting layout {0:?}: expected \"smsm\", \"smms\", \"mssm\" or \"msms\"")]
    InvalidStartLayout(String),
    #[error("no move history to undo")]
    EmptyHistory,
    #[error("move {0:?} is not legal in this position")]
    IllegalMove(String),
}

/// One applied move plus everything needed to reverse it and to answer the
/// repetition and quiet-ending questions later.
#[derive(Debug, Clone)]
struct HistoryEntry {
    mv: Move,
    /// Position hash before the move.
    board_hash: u64,
    /// Play hash before the move.
    play_hash: u64,
    /// Whether the position after the move has the side to move in check.
    was_check: bool,
}

/// A Janggi position with history.
///
/// Cells use `y * 10 + x` indexing over a 100-byte array (column 9 unused);
/// this keeps the palace square tables one-dimensional. The board carries two
/// hashes: `board_hash` is the XOR of Zobrist keys over occupied squares and
/// identifies the position alone; `play_hash` additionally mixes a
/// ply-dependent salt with a one-bit rotation per update, so the same
/// position reached along different paths (or at a different ply) keys
/// differently. Evaluation caches key on `play_hash`; repetition detection
/// compares `board_hash`.
#[derive(Debug, Clone)]
pub struct Board {
    cells: [u8; 100],
    to_move: Side,
    history: Vec<HistoryEntry>,
    board_hash: u64,
    play_hash: u64,
    score_cho: f32,
    score_han: f32,
    rules: RulesConfig,
    legal_cache: Option<Vec<Move>>,
    opponent_cache: Option<Vec<Move>>,
}

impl Board {
    /// Build the opening position from textual start codes.
    pub fn new(cho: &str, han: &str, rules: RulesConfig) -> Result<Board, BoardError> {
        let cho = StartLayout::parse(cho)
            .ok_or_else(|| BoardError::InvalidStartLayout(cho.to_string()))?;
        let han = StartLayout::parse(han)
            .ok_or_else(|| BoardError::InvalidStartLayout(han.to_string()))?;
        Ok(Self::from_layouts(cho, han, rules))
    }

    /// Build the opening position from parsed layouts.
    pub fn from_layouts(cho: StartLayout, han: StartLayout, rules: RulesConfig) -> Board {
        let mut cells = [EMPTY; 100];

        // Rank 9 is Cho's back rank, rank 0 is Han's.
        for (x, &code) in cho.back_rank().iter().enumerate() {
            cells[90 + x] = code;
        }
        for (x, &code) in han.back_rank().iter().enumerate() {
            if code != EMPTY {
                cells[x] = code | 0x10;
            }
        }
        // Generals.
        cells[84] = 0x00;
        cells[14] = 0x10;
        // Cannons.
        cells[71] = 0x09;
        cells[77] = 0x0a;
        cells[21] = 0x19;
        cells[27] = 0x1a;
        // Soldiers.
        for (i, x) in [0usize, 2, 4, 6, 8].into_iter().enumerate() {
            cells[60 + x] = 0x0b + i as u8;
            cells[30 + x] = 0x1b + i as u8;
        }

        let z = zobrist();
        let mut board_hash = 0u64;
        for y in 0..BOARD_H {
            for x in 0..BOARD_W {
                let code = cells[y * 10 + x];
                if code != EMPTY {
                    board_hash ^= z.key(y, x, code);
                }
            }
        }

        Board {
            cells,
            to_move: Side::Cho,
            history: Vec::new(),
            board_hash,
            play_hash: board_hash,
            score_cho: 72.0,
            score_han: 73.5,
            rules,
            legal_cache: None,
            opponent_cache: None,
        }
    }

    /// Build an arbitrary position from (square, piece code) pairs, with an
    /// empty history. Intended for analysis setups; both Generals must be
    /// present for the position to be playable.
    pub fn from_position(pieces: &[(usize, u8)], to_move: Side, rules: RulesConfig) -> Board {
        let mut cells = [EMPTY; 100];
        let z = zobrist();
        let mut board_hash = 0u64;
        let mut score_cho = 0.0;
        let mut score_han = 1.5;
        for &(yx, code) in pieces {
            debug_assert!(yx % 10 < BOARD_W && code < EMPTY);
            cells[yx] = code;
            board_hash ^= z.key(yx / 10, yx % 10, code);
            match piece_side(code) {
                Some(Side::Cho) => score_cho += piece_value(code),
                Some(Side::Han) => score_han += piece_value(code),
                None => {}
            }
        }
        Board {
            cells,
            to_move,
            history: Vec::new(),
            board_hash,
            play_hash: board_hash,
            score_cho,
            score_han,
            rules,
            legal_cache: None,
            opponent_cache: None,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn to_move(&self) -> Side {
        self.to_move
    }

    #[inline]
    pub fn movenum(&self) -> usize {
        self.history.len()
    }

    #[inline]
    pub fn board_hash(&self) -> u64 {
        self.board_hash
    }

    #[inline]
    pub fn play_hash(&self) -> u64 {
        self.play_hash
    }

    #[inline]
    pub fn score_cho(&self) -> f32 {
        self.score_cho
    }

    #[inline]
    pub fn score_han(&self) -> f32 {
        self.score_han
    }

    /// Material of one side.
    #[inline]
    pub fn score_of(&self, side: Side) -> f32 {
        match side {
            Side::Cho => self.score_cho,
            Side::Han => self.score_han,
        }
    }

    #[inline]
    pub fn piece_on(&self, yx: usize) -> u8 {
        self.cells[yx]
    }

    #[inline]
    pub fn rules(&self) -> RulesConfig {
        self.rules
    }

    /// Board position and path equality, as used by subtree reuse.
    pub fn same_game(&self, other: &Board) -> bool {
        if self.cells != other.cells || self.to_move != other.to_move {
            return false;
        }
        if self.history.len() != other.history.len() {
            return false;
        }
        self.history
            .iter()
            .zip(other.history.iter())
            .all(|(a, b)| a.mv == b.mv)
    }

    pub fn clear_move_caches(&mut self) {
        self.legal_cache = None;
        self.opponent_cache = None;
    }

    // ------------------------------------------------------------------
    // Move generation
    // ------------------------------------------------------------------

    fn raw_gen(&self, side: Side) -> RawGen<'_> {
        RawGen::new(
            &self.cells,
            side,
            self.score_of(side.opponent()),
            self.rules.allow_bikjang,
        )
    }

    /// Collect pseudo-legal moves for `side` without touching the caches.
    fn raw_moves_for(&self, side: Side) -> Vec<Move> {
        let mut out = Vec::with_capacity(64);
        self.raw_gen(side).for_each(&mut |from, to| {
            out.push(Move::new(
                self.cells[from as usize],
                from as u8,
                to as u8,
                self.cells[to as usize],
            ));
        });
        out
    }

    pub(crate) fn raw_moves(&self) -> Vec<Move> {
        self.raw_moves_for(self.to_move)
    }

    /// Legal moves for the side to move. With `jang_move_is_illegal` set,
    /// moves that leave the mover's General capturable are filtered out by
    /// playing each candidate and probing the reply.
    pub fn legal_moves(&mut self) -> &[Move] {
        if self.legal_cache.is_none() {
            let raw = self.raw_moves();
            let moves = if self.rules.jang_move_is_illegal {
                let mut keep = Vec::with_capacity(raw.len());
                for m in raw {
                    self.apply_piece_move(&m);
                    if !self.can_win_immediately() {
                        keep.push(m);
                    }
                    self.undo_piece_move(&m);
                }
                keep
            } else {
                raw
            };
            self.legal_cache = Some(moves);
        }
        self.legal_cache.as_deref().unwrap_or(&[])
    }

    /// Legal moves the opponent would have if it were their turn. Never
    /// filtered for check exposure.
    pub fn legal_moves_if_opponent(&mut self) -> &[Move] {
        if self.opponent_cache.is_none() {
            self.opponent_cache = Some(self.raw_moves_for(self.to_move.opponent()));
        }
        self.opponent_cache.as_deref().unwrap_or(&[])
    }

    /// Whether the side to move could capture a General right now. Bikjang
    /// does not count.
    pub(crate) fn can_win_immediately(&self) -> bool {
        let mut found = false;
        self.raw_gen(self.to_move).for_each(&mut |from, to| {
            if from != to
                && !is_general(self.cells[from as usize])
                && is_general(self.cells[to as usize])
            {
                found = true;
            }
        });
        found
    }

    /// Cache-free check probe: could the opponent capture a General if it
    /// were their turn? Used by the tactical search, which bypasses the
    /// legal-move caches entirely.
    pub(crate) fn opponent_threatens_general(&self) -> bool {
        let opp = self.to_move.opponent();
        let mut found = false;
        self.raw_gen(opp).for_each(&mut |from, to| {
            if from != to
                && !is_general(self.cells[from as usize])
                && is_general(self.cells[to as usize])
            {
                found = true;
            }
        });
        found
    }

    /// Whether the side to move is in check.
    pub fn is_check(&mut self) -> bool {
        let moves = self.legal_moves_if_opponent();
        moves
            .iter()
            .any(|m| !m.is_pass() && m.captured != EMPTY && is_general(m.captured))
    }

    /// Resolve a textual move against the current legal moves.
    pub fn find_move(&mut self, text: &str) -> Result<Move, BoardError> {
        self.legal_moves()
            .iter()
            .copied()
            .find(|m| m.to_text(false) == text)
            .ok_or_else(|| BoardError::IllegalMove(text.to_string()))
    }

    /// The subset of legal moves that do not lose on the spot: generation
    /// runs with `jang_move_is_illegal` forced on, and any move after which
    /// the game is already decided against the mover is dropped. Rule flags
    /// and caches are restored afterwards.
    pub fn legal_moves_strict(&mut self) -> Vec<Move> {
        let saved = self.rules;
        self.rules.jang_move_is_illegal = true;
        self.clear_move_caches();

        let me = self.to_move;
        let moves = self.legal_moves().to_vec();
        let mut keep = Vec::with_capacity(moves.len());
        for m in moves {
            self.play(m);
            let w = self.winner();
            if w.is_none() || w == Some(me) {
                keep.push(m);
            }
            // The move we just made is on top of the history.
            let _ = self.undo();
        }

        self.rules = saved;
        self.clear_move_caches();
        keep
    }

    // ------------------------------------------------------------------
    // Make / unmake
    // ------------------------------------------------------------------

    /// Cells, side-to-move and position hash only; no history, play hash,
    /// score or cache bookkeeping. This is the inner step of `play` and the
    /// whole step of the tactical search.
    pub(crate) fn apply_piece_move(&mut self, m: &Move) {
        let piece = self.cells[m.from as usize];
        self.cells[m.from as usize] = EMPTY;
        self.cells[m.to as usize] = piece;
        self.to_move = self.to_move.opponent();

        // A pass moves nothing, so the position hash stays a pure XOR over
        // occupied squares.
        if !m.is_pass() {
            let z = zobrist();
            let (ty, tx) = (m.to as usize / 10, m.to as usize % 10);
            let (fy, fx) = (m.from as usize / 10, m.from as usize % 10);
            if m.captured != EMPTY {
                self.board_hash ^= z.key(ty, tx, m.captured);
            }
            self.board_hash ^= z.key(ty, tx, piece);
            self.board_hash ^= z.key(fy, fx, piece);
        }
    }

    pub(crate) fn undo_piece_move(&mut self, m: &Move) {
        let piece = self.cells[m.to as usize];
        debug_assert!(piece < EMPTY);
        self.cells[m.to as usize] = m.captured;
        self.cells[m.from as usize] = piece;
        self.to_move = self.to_move.opponent();

        if !m.is_pass() {
            let z = zobrist();
            let (ty, tx) = (m.to as usize / 10, m.to as usize % 10);
            let (fy, fx) = (m.from as usize / 10, m.from as usize % 10);
            self.board_hash ^= z.key(fy, fx, piece);
            self.board_hash ^= z.key(ty, tx, piece);
            if m.captured != EMPTY {
                self.board_hash ^= z.key(ty, tx, m.captured);
            }
        }
    }

    /// Play a move. The move must come from this position's legal moves.
    pub fn play(&mut self, m: Move) {
        self.clear_move_caches();

        let piece = self.cells[m.from as usize];
        let old_board_hash = self.board_hash;
        let old_play_hash = self.play_hash;

        self.apply_piece_move(&m);

        // Salted, rotated play-hash update. The salt depends on the ply so
        // that transpositions at different depths key apart; the rotation
        // makes the update order-sensitive and reversible.
        let z = zobrist();
        let ply = self.history.len();
        let mut mix = |y: usize, x: usize, code: u8| {
            self.play_hash ^= z.salted_key(y, x, code, ply);
            self.play_hash = self.play_hash.rotate_left(1);
        };
        let (ty, tx) = (m.to as usize / 10, m.to as usize % 10);
        let (fy, fx) = (m.from as usize / 10, m.from as usize % 10);
        if m.captured != EMPTY {
            mix(ty, tx, m.captured);
        }
        mix(ty, tx, piece);
        mix(fy, fx, piece);

        // was_check is about the position after the move.
        let was_check = self.is_check();
        self.history.push(HistoryEntry {
            mv: m,
            board_hash: old_board_hash,
            play_hash: old_play_hash,
            was_check,
        });

        if m.captured != EMPTY && !m.is_pass() {
            match piece_side(m.captured) {
                Some(Side::Cho) => self.score_cho -= piece_value(m.captured),
                Some(Side::Han) => self.score_han -= piece_value(m.captured),
                None => {}
            }
        }
    }

    /// Undo the last move, restoring the board bit for bit.
    pub fn undo(&mut self) -> Result<Move, BoardError> {
        let entry = self.history.last().ok_or(BoardError::EmptyHistory)?;
        let m = entry.mv;
        let prev_board_hash = entry.board_hash;
        let prev_play_hash = entry.play_hash;
        self.clear_move_caches();

        let piece = self.cells[m.to as usize];
        self.undo_piece_move(&m);

        let z = zobrist();
        let ply = self.history.len() - 1;
        let mut unmix = |y: usize, x: usize, code: u8| {
            self.play_hash = self.play_hash.rotate_right(1);
            self.play_hash ^= z.salted_key(y, x, code, ply);
        };
        let (ty, tx) = (m.to as usize / 10, m.to as usize % 10);
        let (fy, fx) = (m.from as usize / 10, m.from as usize % 10);
        unmix(fy, fx, piece);
        unmix(ty, tx, piece);
        if m.captured != EMPTY {
            unmix(ty, tx, m.captured);
        }

        debug_assert_eq!(self.board_hash, prev_board_hash);
        debug_assert_eq!(self.play_hash, prev_play_hash);

        self.history.pop();

        if m.captured != EMPTY && !m.is_pass() {
            match piece_side(m.captured) {
                Some(Side::Cho) => self.score_cho += piece_value(m.captured),
                Some(Side::Han) => self.score_han += piece_value(m.captured),
                None => {}
            }
        }

        Ok(m)
    }

    // ------------------------------------------------------------------
    // Terminality
    // ------------------------------------------------------------------

    /// Which Generals are still standing. `None` while both live (or in the
    /// degenerate case of neither).
    pub(crate) fn winner_piece_only(&self) -> Option<Side> {
        let mut cho = false;
        let mut han = false;
        for y in 0..3 {
            for x in 3..6 {
                if self.cells[y * 10 + x] == 0x10 {
                    han = true;
                }
            }
        }
        for y in BOARD_H - 3..BOARD_H {
            for x in 3..6 {
                if self.cells[y * 10 + x] == 0x00 {
                    cho = true;
                }
            }
        }
        match (cho, han) {
            (true, false) => Some(Side::Cho),
            (false, true) => Some(Side::Han),
            _ => None,
        }
    }

    fn score_ending(&self) -> Side {
        // Han's 1.5 compensation breaks exact material ties.
        if self.score_cho > self.score_han {
            Side::Cho
        } else {
            Side::Han
        }
    }

    /// Terminal-state predicate; `None` means the game goes on.
    ///
    /// Checks, in order: no-legal-move loss (when check-exposing moves are
    /// illegal), the configured repetition rule, quiet endings under low
    /// material or after 200 plies, the 240-ply hard cap, a double pass, and
    /// finally a missing General.
    pub fn winner(&mut self) -> Option<Side> {
        if self.rules.jang_move_is_illegal && self.legal_moves().is_empty() {
            return Some(self.to_move.opponent());
        }

        let mut repeat_cnt = 0usize;
        let sz = self.history.len();
        if self.rules.board_based_repetitive_move {
            // Count how often the pre-last-move position recurs at 4-ply
            // strides.
            if sz >= 8 && !self.history[sz - 1].mv.is_pass() {
                let target = self.history[sz - 1].board_hash;
                let mut pt = sz as isize - 1;
                while repeat_cnt < 3 && pt >= 0 {
                    if self.history[pt as usize].board_hash == target {
                        repeat_cnt += 1;
                        pt -= 4;
                    } else {
                        break;
                    }
                }
            }
            // A repetition forced by check is not punished.
            if repeat_cnt >= 3 && self.history[sz - 2].was_check {
                repeat_cnt = 0;
            }
        } else if sz >= 5 {
            // Move-based variant compares (piece, destination) rather than
            // (source, destination); captures, passes and General/Guard
            // moves never count.
            let mv = self.history[sz - 1].mv;
            let piece_exempt = matches!(mv.piece, 0 | 1 | 2 | 16 | 17 | 18);
            if !mv.is_pass() && !piece_exempt {
                let mut pt = sz as isize - 5;
                while repeat_cnt < 2 && pt >= 0 {
                    let past = &self.history[pt as usize].mv;
                    if past.is_pass() {
                        pt -= 4;
                    } else if mv.captured == EMPTY
                        && past.captured == EMPTY
                        && mv.piece == past.piece
                        && mv.to == past.to
                    {
                        repeat_cnt += 1;
                        pt -= 4;
                    } else {
                        break;
                    }
                }
            }
            if sz >= 2 && self.history[sz - 2].was_check {
                repeat_cnt = 0;
            }
        }

        // The repeater loses: the side now to move wins.
        if repeat_cnt >= 2 {
            return Some(self.to_move);
        }

        let sc = self.score_cho;
        let sh = self.score_han;
        if (sc < 10.0 || sh < 10.0 || sz >= 200)
            && sz > 0
            && self.history[sz - 1].mv.captured == EMPTY
            && !self.history[sz - 1].was_check
            && !self.is_check()
        {
            return Some(self.score_ending());
        }

        // Hard cap against unbounded check sequences.
        if sz >= 240 {
            return Some(self.score_ending());
        }

        if sz >= 2 && self.history[sz - 1].mv.is_pass() && self.history[sz - 2].mv.is_pass() {
            return Some(self.score_ending());
        }

        self.winner_piece_only()
    }

    // ------------------------------------------------------------------
    // Display
    // ------------------------------------------------------------------

    /// ANSI-colored board dump; the last move's destination is marked with
    /// parentheses.
    pub fn print(&self, out: &mut impl Write, flip: bool) -> io::Result<()> {
        writeln!(out, "To move : {}", self.to_move)?;

        let highlight = self.history.last().map(|e| e.mv.to as usize);

        writeln!(out, "   1  2  3  4  5  6  7  8  9")?;
        for y in 0..BOARD_H {
            let row_label = (y + 1) % 10;
            write!(out, "{} ", row_label)?;
            let yy = if flip { BOARD_H - y - 1 } else { y };
            for x in 0..BOARD_W {
                let code = self.cells[yy * 10 + x];
                let tok = match code {
                    0x00 => "G",
                    0x10 => "g",
                    0x01 | 0x02 => "X",
                    0x11 | 0x12 => "x",
                    0x03 | 0x04 => "C",
                    0x13 | 0x14 => "c",
                    0x05 | 0x06 => "S",
                    0x15 | 0x16 => "s",
                    0x07 | 0x08 => "M",
                    0x17 | 0x18 => "m",
                    0x09 | 0x0a => "P",
                    0x19 | 0x1a => "p",
                    0x0b..=0x0f => "J",
                    0x1b..=0x1f => "j",
                    _ => ".",
                };
                match code >> 4 {
                    0 => write!(out, "\x1b[1;32m")?,
                    1 => write!(out, "\x1b[1;31m")?,
                    _ => {}
                }
                if highlight == Some(yy * 10 + x) {
                    write!(out, "({})", tok)?;
                } else {
                    write!(out, " {} ", tok)?;
                }
                write!(out, "\x1b[0m")?;
            }
            writeln!(out, " {}", row_label)?;
        }
        writeln!(out, "   1  2  3  4  5  6  7  8  9")
    }
}
