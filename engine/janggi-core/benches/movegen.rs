//! Move generation and make/unmake throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use engine_config::RulesConfig;
use janggi_core::{Board, StartLayout};

fn bench_legal_moves(c: &mut Criterion) {
    c.bench_function("legal_moves_opening", |b| {
        let board = Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default());
        b.iter(|| {
            let mut board = board.clone();
            criterion::black_box(board.legal_moves().len())
        });
    });

    c.bench_function("legal_moves_checked", |b| {
        let rules = RulesConfig {
            jang_move_is_illegal: true,
            ..RulesConfig::default()
        };
        let board = Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, rules);
        b.iter(|| {
            let mut board = board.clone();
            criterion::black_box(board.legal_moves().len())
        });
    });
}

fn bench_make_unmake(c: &mut Criterion) {
    c.bench_function("play_undo_pair", |b| {
        let mut board =
            Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default());
        let m = board.legal_moves()[0];
        b.iter(|| {
            board.play(m);
            board.undo().unwrap();
        });
    });
}

criterion_group!(benches, bench_legal_moves, bench_make_unmake);
criterion_main!(benches);
