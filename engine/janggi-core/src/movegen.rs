//! Raw (pseudo-legal) move generation.
//!
//! Squares are scanned in row-major order and each piece emits its moves in
//! a fixed internal order, so generation is deterministic. The emitted moves
//! are "raw": the check-exposure filter and terminality concerns live in
//! `Board`.
//!
//! Palace geometry is hardwired by square index (`y * 10 + x`): the palaces
//! occupy columns 3..=5 on ranks 0..=2 (Han) and 7..=9 (Cho); diagonals run
//! through the corners and the center squares 14 and 84.

use crate::types::{is_cannon, is_general, Side, EMPTY};
use crate::{BOARD_H, BOARD_W};

const H: i32 = BOARD_H as i32;
const W: i32 = BOARD_W as i32;

pub(crate) struct RawGen<'a> {
    cells: &'a [u8; 100],
    to_move: Side,
    /// Material of the side to move's opponent; bikjang is only available
    /// once the opponent has lost at least one piece.
    opponent_score: f32,
    allow_bikjang: bool,
}

impl<'a> RawGen<'a> {
    pub fn new(
        cells: &'a [u8; 100],
        to_move: Side,
        opponent_score: f32,
        allow_bikjang: bool,
    ) -> Self {
        Self {
            cells,
            to_move,
            opponent_score,
            allow_bikjang,
        }
    }

    #[inline]
    fn at(&self, yx: i32) -> u8 {
        self.cells[yx as usize]
    }

    #[inline]
    fn is_empty(&self, yx: i32) -> bool {
        self.at(yx) == EMPTY
    }

    #[inline]
    fn same_side(&self, a: i32, b: i32) -> bool {
        (self.at(a) >> 4) == (self.at(b) >> 4)
    }

    #[inline]
    fn in_range(y: i32, x: i32) -> bool {
        (0..H).contains(&y) && (0..W).contains(&x)
    }

    /// Emit every pseudo-legal move for the side to move, in generation
    /// order, ending with the pass move.
    pub fn for_each(&self, emit: &mut impl FnMut(i32, i32)) {
        let side_nibble = self.to_move.nibble();
        let mut general_pos = -1;

        for y in 0..H {
            for x in 0..W {
                let yx = y * 10 + x;
                let code = self.at(yx);
                if code >> 4 != side_nibble {
                    continue;
                }
                match code & 0x0f {
                    0 => {
                        general_pos = yx;
                        self.palace_steps(yx, emit);
                        if self.allow_bikjang {
                            self.bikjang(yx, emit);
                        }
                    }
                    1 | 2 => self.palace_steps(yx, emit),
                    3 | 4 => self.chariot(yx, emit),
                    5 | 6 => self.elephant(yx, emit),
                    7 | 8 => self.horse(yx, emit),
                    9 | 10 => self.cannon(yx, emit),
                    _ => self.soldier(yx, emit),
                }
            }
        }

        // Pass: the General stays put.
        if general_pos >= 0 {
            emit(general_pos, general_pos);
        }
    }

    /// General and Guard steps, enumerated per palace square. Orthogonals
    /// always, diagonals only where the palace diagonal runs.
    fn palace_steps(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        let deltas: &[i32] = match from {
            3 | 73 => &[1, 10, 11],
            4 | 74 => &[-1, 10, 1],
            5 | 75 => &[-1, 10, 9],
            13 | 83 => &[-10, 10, 1],
            14 | 84 => &[-11, -10, -9, -1, 1, 9, 10, 11],
            15 | 85 => &[-1, -10, 10],
            23 | 93 => &[1, -10, -9],
            24 | 94 => &[-1, 1, -10],
            25 | 95 => &[-11, -10, -1],
            _ => unreachable!("General or Guard outside the palace"),
        };
        for &d in deltas {
            let to = from + d;
            if !self.same_side(from, to) {
                emit(from, to);
            }
        }
    }

    fn chariot(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        // Emits the move unless blocked by a friend; reports whether the ray
        // stops here.
        let mut slide = |to: i32| -> bool {
            if !self.same_side(from, to) {
                emit(from, to);
            }
            !self.is_empty(to)
        };
        let y = from / 10;
        let x = from % 10;

        let mut yo = y - 1;
        while yo >= 0 && !slide(yo * 10 + x) {
            yo -= 1;
        }
        yo = y + 1;
        while yo < H && !slide(yo * 10 + x) {
            yo += 1;
        }
        let mut xo = x - 1;
        while xo >= 0 && !slide(y * 10 + xo) {
            xo -= 1;
        }
        xo = x + 1;
        while xo < W && !slide(y * 10 + xo) {
            xo += 1;
        }

        // Palace diagonals, rising towards smaller ranks.
        if matches!(from, 93 | 84 | 75 | 23 | 14 | 5) {
            let (mut xo, mut yo) = (x + 1, y - 1);
            while xo < 6 && !slide(yo * 10 + xo) {
                xo += 1;
                yo -= 1;
            }
            let (mut xo, mut yo) = (x - 1, y + 1);
            while xo >= 3 && !slide(yo * 10 + xo) {
                xo -= 1;
                yo += 1;
            }
        }
        // Palace diagonals, falling towards larger ranks.
        if matches!(from, 95 | 84 | 73 | 25 | 14 | 3) {
            let (mut xo, mut yo) = (x + 1, y + 1);
            while xo < 6 && !slide(yo * 10 + xo) {
                xo += 1;
                yo += 1;
            }
            let (mut xo, mut yo) = (x - 1, y - 1);
            while xo >= 3 && !slide(yo * 10 + xo) {
                xo -= 1;
                yo -= 1;
            }
        }
    }

    /// Cannon ray walk: skip to the screen (which must not be a cannon),
    /// then capture/stop rules apply beyond it. Cannons never take cannons.
    fn cannon_ray(
        &self,
        from: i32,
        mut xo: i32,
        mut yo: i32,
        dx: i32,
        dy: i32,
        cont: impl Fn(i32, i32) -> bool,
        emit: &mut impl FnMut(i32, i32),
    ) {
        let mut found_screen = false;
        while cont(yo, xo) {
            let to = yo * 10 + xo;
            if !found_screen {
                if !self.is_empty(to) {
                    if is_cannon(self.at(to)) {
                        break;
                    }
                    found_screen = true;
                }
            } else {
                let target = self.at(to);
                if !is_cannon(target) && !self.same_side(from, to) {
                    emit(from, to);
                }
                if !self.is_empty(to) {
                    break;
                }
            }
            xo += dx;
            yo += dy;
        }
    }

    fn cannon(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        let y = from / 10;
        let x = from % 10;

        self.cannon_ray(from, x, y - 1, 0, -1, |yo, _| yo >= 0, emit);
        self.cannon_ray(from, x, y + 1, 0, 1, |yo, _| yo < H, emit);
        self.cannon_ray(from, x - 1, y, -1, 0, |_, xo| xo >= 0, emit);
        self.cannon_ray(from, x + 1, y, 1, 0, |_, xo| xo < W, emit);

        // Palace diagonals: only the corner squares can jump through the
        // center.
        if matches!(from, 93 | 75 | 23 | 5) {
            self.cannon_ray(from, x + 1, y - 1, 1, -1, |_, xo| xo < 6, emit);
            self.cannon_ray(from, x - 1, y + 1, -1, 1, |_, xo| xo >= 3, emit);
        }
        if matches!(from, 95 | 73 | 25 | 3) {
            self.cannon_ray(from, x + 1, y + 1, 1, 1, |_, xo| xo < 6, emit);
            self.cannon_ray(from, x - 1, y - 1, -1, -1, |_, xo| xo >= 3, emit);
        }
    }

    /// (2,1)-leaper: one orthogonal step that must be empty, then one
    /// diagonal step outward.
    fn horse(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        let y = from / 10;
        let x = from % 10;

        let mut check = |mid_y: i32, mid_x: i32, tgts: [(i32, i32); 2]| {
            if !Self::in_range(mid_y, mid_x) || !self.is_empty(mid_y * 10 + mid_x) {
                return;
            }
            for (ty, tx) in tgts {
                if Self::in_range(ty, tx) && !self.same_side(from, ty * 10 + tx) {
                    emit(from, ty * 10 + tx);
                }
            }
        };

        check(y, x + 1, [(y + 1, x + 2), (y - 1, x + 2)]);
        check(y, x - 1, [(y + 1, x - 2), (y - 1, x - 2)]);
        check(y + 1, x, [(y + 2, x + 1), (y + 2, x - 1)]);
        check(y - 1, x, [(y - 2, x + 1), (y - 2, x - 1)]);
    }

    /// (3,2)-leaper: one orthogonal step and one diagonal step must both be
    /// empty before the final diagonal step.
    fn elephant(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        let y = from / 10;
        let x = from % 10;

        let mut check = |mid_y: i32,
                         mid_x: i32,
                         diags: [((i32, i32), (i32, i32)); 2]| {
            if !Self::in_range(mid_y, mid_x) || !self.is_empty(mid_y * 10 + mid_x) {
                return;
            }
            for ((my, mx), (ty, tx)) in diags {
                if Self::in_range(my, mx)
                    && self.is_empty(my * 10 + mx)
                    && Self::in_range(ty, tx)
                    && !self.same_side(from, ty * 10 + tx)
                {
                    emit(from, ty * 10 + tx);
                }
            }
        };

        check(
            y,
            x + 1,
            [
                ((y + 1, x + 2), (y + 2, x + 3)),
                ((y - 1, x + 2), (y - 2, x + 3)),
            ],
        );
        check(
            y,
            x - 1,
            [
                ((y + 1, x - 2), (y + 2, x - 3)),
                ((y - 1, x - 2), (y - 2, x - 3)),
            ],
        );
        check(
            y + 1,
            x,
            [
                ((y + 2, x + 1), (y + 3, x + 2)),
                ((y + 2, x - 1), (y + 3, x - 2)),
            ],
        );
        check(
            y - 1,
            x,
            [
                ((y - 2, x + 1), (y - 3, x + 2)),
                ((y - 2, x - 1), (y - 3, x - 2)),
            ],
        );
    }

    /// Single step forward or sideways; forward diagonals inside the enemy
    /// palace.
    fn soldier(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        let y = from / 10;
        let x = from % 10;
        let fwd = if self.to_move == Side::Cho { -1 } else { 1 };

        let mut step = |yo: i32, xo: i32| {
            if Self::in_range(yo, xo) && !self.same_side(from, yo * 10 + xo) {
                emit(from, yo * 10 + xo);
            }
        };

        step(y + fwd, x);
        step(y, x + 1);
        step(y, x - 1);

        // Palace-diagonal steps, keyed by square: the center squares fan out
        // both ways, the near corners have a single diagonal towards the
        // center.
        match from {
            14 => {
                step(y - 1, x - 1);
                step(y - 1, x + 1);
            }
            84 => {
                step(y + 1, x - 1);
                step(y + 1, x + 1);
            }
            23 => step(y - 1, x + 1),
            25 => step(y - 1, x - 1),
            73 => step(y + 1, x + 1),
            75 => step(y + 1, x - 1),
            _ => {}
        }
    }

    /// Face-off: a General may walk onto the enemy General along a fully
    /// open file, emitted as a capture. Only available while the opponent is
    /// behind on material.
    fn bikjang(&self, from: i32, emit: &mut impl FnMut(i32, i32)) {
        if self.opponent_score >= 72.0 {
            return;
        }
        let mut y = from / 10;
        let x = from % 10;
        if y > 6 {
            y -= 1;
            while y >= 0 {
                let yx = y * 10 + x;
                if !self.is_empty(yx) {
                    if is_general(self.at(yx)) {
                        emit(from, yx);
                    } else {
                        break;
                    }
                }
                y -= 1;
            }
        } else {
            y += 1;
            while y < H {
                let yx = y * 10 + x;
                if !self.is_empty(yx) {
                    if is_general(self.at(yx)) {
                        emit(from, yx);
                    } else {
                        break;
                    }
                }
                y += 1;
            }
        }
    }
}
