//! Board behavior tests: generation, make/unmake, hashing, terminality.

use engine_config::RulesConfig;

use crate::board::Board;
use crate::moves::Move;
use crate::types::{piece_side, piece_value, Side, StartLayout, EMPTY};
use crate::zobrist::zobrist;
use crate::{BOARD_H, BOARD_W};

fn opening(rules: RulesConfig) -> Board {
    Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, rules)
}

fn default_rules() -> RulesConfig {
    RulesConfig::default()
}

/// Deterministic pseudo-random walk over legal non-pass moves.
fn walk(board: &mut Board, plies: usize) -> Vec<Move> {
    let mut played = Vec::new();
    for i in 0..plies {
        if board.winner().is_some() {
            break;
        }
        let moves: Vec<Move> = board
            .legal_moves()
            .iter()
            .copied()
            .filter(|m| !m.is_pass())
            .collect();
        if moves.is_empty() {
            break;
        }
        let m = moves[(i * 7 + 3) % moves.len()];
        board.play(m);
        played.push(m);
    }
    played
}

fn recompute_board_hash(board: &Board) -> u64 {
    let z = zobrist();
    let mut hash = 0u64;
    for y in 0..BOARD_H {
        for x in 0..BOARD_W {
            let code = board.piece_on(y * 10 + x);
            if code != EMPTY {
                hash ^= z.key(y, x, code);
            }
        }
    }
    hash
}

#[test]
fn opening_move_count_and_shape() {
    let mut board = opening(default_rules());

    let moves = board.legal_moves().to_vec();
    // 31 piece moves plus exactly one pass from the standard smsm start.
    assert_eq!(moves.len(), 32);
    assert_eq!(moves.iter().filter(|m| m.is_pass()).count(), 1);

    // No captures are available on the first move.
    assert!(moves
        .iter()
        .filter(|m| !m.is_pass())
        .all(|m| m.captured == EMPTY));

    assert_eq!(board.winner(), None);
    assert_eq!(board.to_move(), Side::Cho);
    assert!((board.score_cho() - 72.0).abs() < 1e-6);
    assert!((board.score_han() - 73.5).abs() < 1e-6);
}

#[test]
fn opening_moves_are_distinct_and_stable() {
    let mut a = opening(default_rules());
    let mut b = opening(default_rules());
    let ma = a.legal_moves().to_vec();
    let mb = b.legal_moves().to_vec();
    assert_eq!(ma, mb);

    for (i, m) in ma.iter().enumerate() {
        for other in &ma[i + 1..] {
            assert_ne!(m, other, "duplicate move generated: {}", m);
        }
    }
}

#[test]
fn make_unmake_restores_everything() {
    let mut board = opening(default_rules());
    let fresh = board.clone();

    let played = walk(&mut board, 24);
    assert!(!played.is_empty());

    for _ in 0..played.len() {
        board.undo().unwrap();
    }

    assert!(board.same_game(&fresh));
    assert_eq!(board.board_hash(), fresh.board_hash());
    assert_eq!(board.play_hash(), fresh.play_hash());
    assert_eq!(board.movenum(), 0);
    assert!((board.score_cho() - fresh.score_cho()).abs() < 1e-6);
    assert!((board.score_han() - fresh.score_han()).abs() < 1e-6);
    for yx in 0..100 {
        assert_eq!(board.piece_on(yx), fresh.piece_on(yx));
    }
}

#[test]
fn board_hash_matches_scratch_recomputation() {
    let mut board = opening(default_rules());
    assert_eq!(board.board_hash(), recompute_board_hash(&board));

    walk(&mut board, 17);
    assert_eq!(board.board_hash(), recompute_board_hash(&board));

    // A pass leaves the position hash alone but still advances the play
    // hash.
    let mut board = opening(default_rules());
    let pass = board
        .legal_moves()
        .iter()
        .copied()
        .find(|m| m.is_pass())
        .unwrap();
    let bh = board.board_hash();
    let ph = board.play_hash();
    board.play(pass);
    assert_eq!(board.board_hash(), bh);
    assert_ne!(board.play_hash(), ph);
}

#[test]
fn play_hash_separates_transpositions_by_ply() {
    // Shuffle two chariots out and back: the position repeats exactly, but
    // four plies later.
    let mut board = opening(default_rules());
    let bh = board.board_hash();
    let ph = board.play_hash();

    for text in ["1-91", "11-21", "91-1", "21-11"] {
        let m = board.find_move(text).unwrap();
        board.play(m);
    }

    assert_eq!(board.board_hash(), bh);
    assert_ne!(board.play_hash(), ph);
}

#[test]
fn material_scores_track_captures() {
    let mut board = opening(default_rules());
    let mut captured_cho = 0.0f32;
    let mut captured_han = 0.0f32;

    for m in walk(&mut board, 60) {
        if m.captured != EMPTY && !m.is_pass() {
            match piece_side(m.captured) {
                Some(Side::Cho) => captured_cho += piece_value(m.captured),
                Some(Side::Han) => captured_han += piece_value(m.captured),
                None => {}
            }
        }
    }

    assert!((board.score_cho() + captured_cho - 72.0).abs() < 1e-4);
    assert!((board.score_han() + captured_han - 73.5).abs() < 1e-4);
}

#[test]
fn double_pass_ends_by_score_and_han_takes_ties() {
    let mut board = opening(default_rules());

    let pass = board
        .legal_moves()
        .iter()
        .copied()
        .find(|m| m.is_pass())
        .unwrap();
    board.play(pass);
    assert_eq!(board.winner(), None);

    let pass = board
        .legal_moves()
        .iter()
        .copied()
        .find(|m| m.is_pass())
        .unwrap();
    board.play(pass);

    // All material intact: 72.0 vs 73.5, Han's compensation decides.
    assert_eq!(board.winner(), Some(Side::Han));
}

#[test]
fn checkmate_leaves_only_pass_then_no_moves() {
    let rules = RulesConfig {
        jang_move_is_illegal: true,
        ..default_rules()
    };
    // Cho's bare General on 85 is boxed in by a chariot on the palace
    // diagonal square 93 (covering 84, 75, 94, 95) and a second chariot
    // sweeping rank 7.
    let mut board = Board::from_position(
        &[(85, 0x00), (14, 0x10), (93, 0x13), (70, 0x14)],
        Side::Cho,
        rules,
    );

    let moves = board.legal_moves().to_vec();
    assert_eq!(moves.len(), 1);
    assert!(moves[0].is_pass());
    assert_eq!(board.winner(), None);

    board.play(moves[0]);

    // Han closes the net: the rank chariot takes the diagonal post 75,
    // defended by its partner, and every Cho reply (the pass included) now
    // loses the General.
    let threat = board
        .legal_moves()
        .iter()
        .copied()
        .find(|m| m.from == 70 && m.to == 75)
        .unwrap();
    board.play(threat);

    assert!(board.legal_moves().is_empty());
    assert_eq!(board.winner(), Some(Side::Han));
}

#[test]
fn board_based_repetition_awards_the_non_repeater() {
    let rules = RulesConfig {
        board_based_repetitive_move: true,
        ..default_rules()
    };
    let mut board = opening(rules);

    // The same quiet 4-ply chariot shuffle, three times over.
    for _ in 0..3 {
        for text in ["1-91", "11-21", "91-1", "21-11"] {
            let m = board.find_move(text).unwrap();
            board.play(m);
        }
    }

    assert_eq!(board.winner(), Some(board.to_move()));
}

#[test]
fn move_based_repetition_awards_the_non_repeater() {
    let rules = default_rules();
    let mut board = opening(rules);

    for _ in 0..3 {
        for text in ["1-91", "11-21", "91-1", "21-11"] {
            let m = board.find_move(text).unwrap();
            board.play(m);
        }
    }

    // The last move repeated its (piece, destination) twice at 4-ply
    // strides.
    assert_eq!(board.winner(), Some(board.to_move()));
}

#[test]
fn bikjang_is_emitted_as_a_general_capture() {
    let rules = RulesConfig {
        allow_bikjang: true,
        ..default_rules()
    };
    // Open file between the Generals; Han is behind on material, so Cho may
    // call the face-off.
    let mut board = Board::from_position(
        &[(84, 0x00), (14, 0x10), (60, 0x0b)],
        Side::Cho,
        rules,
    );

    let faceoff = board
        .legal_moves()
        .iter()
        .copied()
        .find(|m| m.from == 84 && m.to == 14);
    assert!(faceoff.is_some());
    assert_eq!(faceoff.unwrap().captured, 0x10);

    // With the face-off disabled the move disappears.
    let mut board = Board::from_position(
        &[(84, 0x00), (14, 0x10), (60, 0x0b)],
        Side::Cho,
        default_rules(),
    );
    assert!(!board
        .legal_moves()
        .iter()
        .any(|m| m.from == 84 && m.to == 14));
}

#[test]
fn check_detection_and_exposure_filter() {
    let rules = RulesConfig {
        jang_move_is_illegal: true,
        ..default_rules()
    };
    // Han chariot on the Cho General's file; a Cho guard on 83 is pinned.
    let mut board = Board::from_position(
        &[(84, 0x00), (83, 0x01), (14, 0x10), (34, 0x13), (54, 0x0b)],
        Side::Cho,
        rules,
    );

    // The chariot does not yet attack through the soldier on 54.
    assert!(!board.is_check());

    // Sideways soldier steps leave the file and expose the General, so the
    // filter drops them; the forward step keeps the block in place.
    let soldier_moves: Vec<Move> = board
        .legal_moves()
        .iter()
        .copied()
        .filter(|m| m.from == 54)
        .collect();
    assert!(soldier_moves.iter().all(|m| m.to == 44));
}

#[test]
fn strict_legal_moves_drop_instant_losses() {
    let mut board = opening(default_rules());
    let strict = board.legal_moves_strict();
    // Nothing hangs a General at the opening, so only the filter's overhead
    // differs.
    assert_eq!(strict.len(), 32);
    // The caches and rules are restored.
    assert_eq!(board.legal_moves().len(), 32);
}

#[test]
fn invalid_layout_is_rejected_and_board_unchanged() {
    assert!(Board::new("smsm", "zzzz", default_rules()).is_err());
    assert!(Board::new("", "smsm", default_rules()).is_err());
    assert!(Board::new("smsm", "smms", default_rules()).is_ok());
}

#[test]
fn undo_on_fresh_board_errors() {
    let mut board = opening(default_rules());
    assert!(board.undo().is_err());
}

#[test]
fn find_move_round_trips_text() {
    let mut board = opening(default_rules());
    let moves = board.legal_moves().to_vec();
    for m in moves {
        let text = m.to_text(false);
        let found = board.find_move(&text).unwrap();
        assert_eq!(found, m);
    }
    assert!(board.find_move("99-99").is_err());
}

#[test]
fn all_four_layouts_have_balanced_material() {
    for cho in [
        StartLayout::Smsm,
        StartLayout::Smms,
        StartLayout::Mssm,
        StartLayout::Msms,
    ] {
        let board = Board::from_layouts(cho, StartLayout::Msms, default_rules());
        assert!((board.score_cho() - 72.0).abs() < 1e-6);
        assert!((board.score_han() - 73.5).abs() < 1e-6);
    }
}
