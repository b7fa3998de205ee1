//! The evaluator front end: raw backends and the two-generation cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, warn};

use engine_config::InferenceConfig;
use janggi_core::{piece_kind, piece_value, Board, Move, PieceKind, Side, EMPTY};

use crate::network::Network;
use crate::weights::WeightsError;

/// Errors surfaced by evaluation.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("weight loading failed: {0}")]
    Weights(#[from] WeightsError),

    #[error("forward pipe failed: {0}")]
    Pipe(String),

    #[error("accelerator self-check failed repeatedly")]
    SelfCheck,
}

/// Policy priors over the legal moves plus a scalar value in [-1, 1]
/// (+1 = the side to move wins).
#[derive(Debug, Clone)]
pub struct EvalResult {
    pub policy: Vec<(Move, f32)>,
    pub value: f32,
}

/// A raw position evaluator: anything that can produce policy priors and a
/// value for a board. The cache in [`PositionEval`] sits in front of this.
pub trait RawEvaluator: Send + Sync {
    fn evaluate_raw(&self, board: &mut Board) -> Result<EvalResult, EvalError>;
}

/// Heuristic fallback used when no network is loaded: uniform policy and a
/// tanh-squashed blend of material, mobility and hanging-capture deltas.
#[derive(Debug, Default)]
pub struct MaterialEvaluator;

fn capture_value(m: &Move) -> f32 {
    if m.captured == EMPTY || m.is_pass() {
        return 0.0;
    }
    if piece_kind(m.captured) == PieceKind::General {
        // Winning the General outranks any exchange.
        28.0
    } else {
        piece_value(m.captured)
    }
}

impl RawEvaluator for MaterialEvaluator {
    fn evaluate_raw(&self, board: &mut Board) -> Result<EvalResult, EvalError> {
        let moves = board.legal_moves().to_vec();

        let mut attack_delta = 0.0f32;
        let policy: Vec<(Move, f32)> = moves
            .iter()
            .map(|&m| (m, 1.0 / moves.len() as f32))
            .collect();
        for m in &moves {
            attack_delta += capture_value(m);
        }
        let opp_moves = board.legal_moves_if_opponent().to_vec();
        for m in &opp_moves {
            attack_delta -= capture_value(m);
        }

        let value = match board.winner() {
            Some(w) if w == board.to_move() => 1.0,
            Some(_) => -1.0,
            None => {
                let mut value = (board.score_han() - board.score_cho()) / 14.4;
                if board.to_move() == Side::Cho {
                    value = -value;
                }
                value += 0.002 * moves.len() as f32 - 0.002 * opp_moves.len() as f32;
                value += attack_delta / 70.0;
                value.tanh()
            }
        };

        Ok(EvalResult { policy, value })
    }
}

/// One cache stripe: two hash-map generations keyed by play hash.
struct CacheBucket {
    primary: HashMap<u64, Arc<EvalResult>>,
    secondary: HashMap<u64, Arc<EvalResult>>,
}

const CACHE_BUCKETS: usize = 16;

/// The evaluator used by the search: a striped, two-generation cache over a
/// raw backend.
///
/// Keys are play hashes, so transpositions reached at different plies cache
/// separately. When a bucket's primary generation fills up, the secondary is
/// dropped and the primary takes its place; a hit in the secondary promotes
/// the entry back into the primary. The effect is a pseudo-LRU with bounded
/// memory and O(1) operations under a per-bucket mutex.
pub struct PositionEval {
    buckets: Vec<Mutex<CacheBucket>>,
    cache_size: usize,
    raw: Box<dyn RawEvaluator>,
}

impl PositionEval {
    /// Evaluator with the heuristic fallback backend.
    pub fn new(config: InferenceConfig) -> Self {
        Self::with_backend(config, Box::new(MaterialEvaluator))
    }

    /// Evaluator over an explicit raw backend.
    pub fn with_backend(config: InferenceConfig, raw: Box<dyn RawEvaluator>) -> Self {
        let buckets = (0..CACHE_BUCKETS)
            .map(|_| {
                Mutex::new(CacheBucket {
                    primary: HashMap::with_capacity(config.cache_size * 2),
                    secondary: HashMap::new(),
                })
            })
            .collect();
        Self {
            buckets,
            cache_size: config.cache_size.max(1),
            raw,
        }
    }

    /// Load a weight file and switch to the network backend. On failure the
    /// current backend stays in place and the error is returned.
    pub fn initialize(&mut self, weights_path: &str, config: InferenceConfig) -> Result<(), EvalError> {
        let network = Network::initialize(weights_path, config)?;
        self.raw = Box::new(network);
        // Cached entries from the previous backend are stale now.
        for bucket in &self.buckets {
            let mut bucket = bucket.lock().expect("cache mutex");
            bucket.primary.clear();
            bucket.secondary.clear();
        }
        Ok(())
    }

    /// Evaluate a board, consulting the cache first.
    pub fn evaluate(&self, board: &mut Board) -> Result<Arc<EvalResult>, EvalError> {
        let hash = board.play_hash();
        let index = (hash % CACHE_BUCKETS as u64) as usize;

        let cached = {
            let mut bucket = self.buckets[index].lock().expect("cache mutex");
            if let Some(hit) = bucket.primary.get(&hash) {
                Some(Arc::clone(hit))
            } else if let Some(hit) = bucket.secondary.remove(&hash) {
                // Promote surviving entries back into the young generation.
                bucket.primary.insert(hash, Arc::clone(&hit));
                Some(hit)
            } else {
                None
            }
        };

        match cached {
            None => {
                // Compute outside the bucket lock; other threads may miss on
                // the same hash and duplicate the work, which is harmless.
                let result = Arc::new(self.raw.evaluate_raw(board)?);
                let mut bucket = self.buckets[index].lock().expect("cache mutex");
                bucket.primary.insert(hash, Arc::clone(&result));
                if bucket.primary.len() >= self.cache_size {
                    debug!(bucket = index, "rotating eval cache generations");
                    bucket.secondary = std::mem::replace(
                        &mut bucket.primary,
                        HashMap::with_capacity(self.cache_size * 2),
                    );
                }
                Ok(result)
            }
            Some(hit) => {
                // A play-hash collision would hand back a result for some
                // other position; the stored move list gives it away.
                let legal = board.legal_moves();
                let mismatch = hit.policy.len() != legal.len()
                    || hit.policy.iter().zip(legal.iter()).any(|((m, _), l)| m != l);
                if !mismatch {
                    return Ok(hit);
                }
                warn!("eval cache collision detected, re-evaluating");
                let result = Arc::new(self.raw.evaluate_raw(board)?);
                let mut bucket = self.buckets[index].lock().expect("cache mutex");
                bucket.primary.insert(hash, Arc::clone(&result));
                Ok(result)
            }
        }
    }

    /// Hammer `evaluate_raw` from `threads` workers for `runtime_ms`;
    /// returns the number of completed evaluations. Used to size batches for
    /// a device.
    pub fn benchmark(&self, board: &Board, threads: usize, runtime_ms: u64) -> usize {
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        let running = AtomicBool::new(true);
        let count = AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for _ in 0..threads.max(1) {
                scope.spawn(|| {
                    let mut local = board.clone();
                    while running.load(Ordering::Relaxed) {
                        if self.raw.evaluate_raw(&mut local).is_err() {
                            break;
                        }
                        count.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
            std::thread::sleep(std::time::Duration::from_millis(runtime_ms));
            running.store(false, Ordering::Relaxed);
        });

        count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_config::RulesConfig;
    use janggi_core::StartLayout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn opening() -> Board {
        Board::from_layouts(StartLayout::Smsm, StartLayout::Smsm, RulesConfig::default())
    }

    fn small_config(cache_size: usize) -> InferenceConfig {
        InferenceConfig {
            cache_size,
            ..InferenceConfig::default()
        }
    }

    /// Counts raw evaluations so cache behavior is observable.
    struct CountingEvaluator {
        calls: std::sync::Arc<AtomicUsize>,
        inner: MaterialEvaluator,
    }

    impl CountingEvaluator {
        fn new() -> (Self, std::sync::Arc<AtomicUsize>) {
            let calls = std::sync::Arc::new(AtomicUsize::new(0));
            (
                Self {
                    calls: std::sync::Arc::clone(&calls),
                    inner: MaterialEvaluator,
                },
                calls,
            )
        }
    }

    impl RawEvaluator for CountingEvaluator {
        fn evaluate_raw(&self, board: &mut Board) -> Result<EvalResult, EvalError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.evaluate_raw(board)
        }
    }

    #[test]
    fn heuristic_policy_is_uniform_over_legal_moves() {
        let mut board = opening();
        let result = MaterialEvaluator.evaluate_raw(&mut board).unwrap();

        assert_eq!(result.policy.len(), 32);
        let p = result.policy[0].1;
        assert!(result.policy.iter().all(|&(_, q)| (q - p).abs() < 1e-7));
        let total: f32 = result.policy.iter().map(|&(_, q)| q).sum();
        assert!((total - 1.0).abs() < 1e-5);

        // Symmetric opening: the value is small.
        assert!(result.value.abs() < 0.2);
    }

    #[test]
    fn repeated_evaluations_hit_the_cache() {
        let eval = PositionEval::with_backend(small_config(100), Box::new(MaterialEvaluator));
        let mut board = opening();

        let a = eval.evaluate(&mut board).unwrap();
        let b = eval.evaluate(&mut board).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn entries_survive_one_rotation_via_promotion() {
        let (backend, calls) = CountingEvaluator::new();
        // cache_size = 1: every miss-insert rotates the generations
        // immediately, so the entry lives in the secondary right after its
        // first evaluation.
        let eval = PositionEval::with_backend(small_config(1), Box::new(backend));
        let mut board = opening();

        let first = eval.evaluate(&mut board).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Each hit promotes the entry out of the old generation; no
        // recomputation happens.
        let again = eval.evaluate(&mut board).unwrap();
        let promoted = eval.evaluate(&mut board).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(Arc::ptr_eq(&first, &promoted));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn second_rotation_evicts_unpromoted_entries() {
        let (backend, calls) = CountingEvaluator::new();
        let eval = PositionEval::with_backend(small_config(1), Box::new(backend));

        let mut board = opening();
        eval.evaluate(&mut board).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Find a nearby position whose play hash lands in the same cache
        // bucket; inserting it rotates that bucket once more, dropping the
        // opening's (unpromoted) generation.
        let bucket = board.play_hash() % 16;
        let mut rival = None;
        'outer: for first in board.legal_moves().to_vec() {
            board.play(first);
            if board.play_hash() % 16 == bucket {
                rival = Some(vec![first]);
                board.undo().unwrap();
                break;
            }
            for second in board.legal_moves().to_vec() {
                board.play(second);
                if board.play_hash() % 16 == bucket {
                    rival = Some(vec![first, second]);
                    board.undo().unwrap();
                    board.undo().unwrap();
                    break 'outer;
                }
                board.undo().unwrap();
            }
            board.undo().unwrap();
        }
        let line = rival.expect("some nearby position shares the bucket");

        for m in &line {
            board.play(*m);
        }
        eval.evaluate(&mut board).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        for _ in &line {
            board.undo().unwrap();
        }

        // The opening entry has been evicted outright: this is a fresh miss.
        eval.evaluate(&mut board).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn terminal_positions_evaluate_to_plus_minus_one() {
        let mut board = opening();
        // Double pass ends the game in Han's favor.
        for _ in 0..2 {
            let pass = board
                .legal_moves()
                .iter()
                .copied()
                .find(|m| m.is_pass())
                .unwrap();
            board.play(pass);
        }
        let result = MaterialEvaluator.evaluate_raw(&mut board).unwrap();
        // Cho to move in a position Han has already won.
        assert!((result.value + 1.0).abs() < 1e-6);
    }

    #[test]
    fn benchmark_counts_evaluations() {
        let eval = PositionEval::new(small_config(100));
        let board = opening();
        let n = eval.benchmark(&board, 2, 50);
        assert!(n > 0);
    }
}
