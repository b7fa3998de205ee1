//! Board-to-tensor encodings.
//!
//! Input: 66 planes of 9x10 floats. Planes 0..16 hold the side to move's
//! pieces (one plane per piece code, swapped so the mover always occupies
//! the low codes), 16..32 the opponent's, 32..48 the mover's legal-move
//! destinations by piece type, 48..64 the opponent's, and 64/65 flag which
//! side is to move.
//!
//! Output: 16 planes of (piece type, destination) visit fractions plus a
//! discounted game-outcome value. These are training targets; play never
//! consumes them.

use janggi_core::{Board, Move, Side, NUM_INTERSECTIONS};

/// Input feature planes.
pub const INPUT_CHANNELS: usize = 66;
/// Policy head output: one plane per piece type.
pub const OUTPUTS_POLICY: usize = 16 * NUM_INTERSECTIONS;
/// Value head hidden width.
pub const OUTPUTS_VALUE: usize = 256;

/// Flat `INPUT_CHANNELS x 90` input tensor, plane-major.
#[derive(Debug, Clone)]
pub struct InputFeatures {
    pub data: Vec<f32>,
}

impl InputFeatures {
    /// One plane as a slice.
    pub fn plane(&self, i: usize) -> &[f32] {
        &self.data[i * NUM_INTERSECTIONS..(i + 1) * NUM_INTERSECTIONS]
    }
}

/// Training policy target (16 x 90) and discounted value target.
#[derive(Debug, Clone)]
pub struct OutputFeatures {
    pub planes: Vec<f32>,
    pub value: f32,
}

/// Dense plane index of a square: squares use a stride-10 layout on the
/// board but the tensors are 9 wide.
#[inline]
fn plane_index(square: u8) -> usize {
    let y = square as usize / 10;
    let x = square as usize % 10;
    y * 9 + x
}

/// Encode a board into the evaluator's input layout.
pub fn encode_input_features(board: &mut Board) -> InputFeatures {
    let mut data = vec![0.0f32; INPUT_CHANNELS * NUM_INTERSECTIONS];
    let han_to_move = board.to_move() == Side::Han;

    for yx_dense in 0..NUM_INTERSECTIONS {
        let yx = (yx_dense / 9) * 10 + (yx_dense % 9);
        let mut code = board.piece_on(yx);
        if code >= 0x20 {
            continue;
        }
        // The net always sees the mover's pieces on the low planes.
        if han_to_move {
            code ^= 0x10;
        }
        data[code as usize * NUM_INTERSECTIONS + yx_dense] = 1.0;
    }

    let own_moves = board.legal_moves().to_vec();
    for m in &own_moves {
        let p = (m.piece & 0x0f) as usize;
        data[(32 + p) * NUM_INTERSECTIONS + plane_index(m.to)] = 1.0;
    }

    let opp_moves = board.legal_moves_if_opponent().to_vec();
    for m in &opp_moves {
        let p = (m.piece & 0x0f) as usize;
        data[(48 + p) * NUM_INTERSECTIONS + plane_index(m.to)] = 1.0;
    }

    let to_move_plane = if han_to_move { 65 } else { 64 };
    data[to_move_plane * NUM_INTERSECTIONS..(to_move_plane + 1) * NUM_INTERSECTIONS].fill(1.0);

    InputFeatures { data }
}

/// Encode search statistics into policy/value training targets.
///
/// Each (move, visits) entry contributes its visit fraction to the
/// (piece type, destination) cell. The value target is the discounted game
/// outcome from the side to move's point of view.
pub fn encode_output_features(
    board: &Board,
    visits: &[(Move, u32)],
    final_winner: Side,
    final_movenum: usize,
) -> OutputFeatures {
    let mut planes = vec![0.0f32; 16 * NUM_INTERSECTIONS];

    let total: u32 = visits.iter().map(|(_, v)| v).sum();
    if total > 0 {
        for (m, v) in visits {
            let piece = board.piece_on(m.from as usize);
            debug_assert!(piece < 0x20);
            let p = (piece & 0x0f) as usize;
            planes[p * NUM_INTERSECTIONS + plane_index(m.to)] = *v as f32 / total as f32;
        }
    }

    let magnitude = (-(final_movenum as f64) / 400.0).exp() as f32;
    let value = if final_winner == board.to_move() {
        magnitude
    } else {
        -magnitude
    };

    OutputFeatures { planes, value }
}
