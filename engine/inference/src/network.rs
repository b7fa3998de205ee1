//! The neural raw evaluator.
//!
//! Encodes a board, sends it through the batching scheduler, and turns the
//! raw head outputs into an [`EvalResult`]: policy logits are masked by the
//! legality planes, softmaxed, and gathered back into legal-move order; the
//! value head finishes with a host-side inner product and tanh.
//!
//! A small fraction of evaluations is replayed on the deterministic host
//! pipe and compared by L2 norm; a run of mismatches indicates a broken
//! device and is fatal.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tracing::{error, info, warn};

use engine_config::InferenceConfig;
use janggi_core::{Board, NUM_INTERSECTIONS};

use crate::cpu::CpuPipe;
use crate::evaluator::{EvalError, EvalResult, RawEvaluator};
use crate::features::{encode_input_features, OUTPUTS_POLICY, OUTPUTS_VALUE};
use crate::pipe::ForwardPipe;
use crate::scheduler::BatchScheduler;
use crate::weights::{load_weights, ForwardPipeWeights};

/// L2 distance beyond which a self-check counts as a mismatch.
const SELFCHECK_MAX_ERROR: f32 = 0.05;
/// Consecutive mismatches tolerated before giving up on the device.
const SELFCHECK_MAX_FAILURES: i32 = 10;
/// One self-check per this many evaluations, on average.
const SELFCHECK_PERIOD: u32 = 10_000;

/// Residual-network evaluator behind the batching scheduler.
pub struct Network {
    scheduler: BatchScheduler,
    /// Deterministic reference path for the self-check.
    reference: CpuPipe,
    ip2_val_w: Vec<f32>,
    ip2_val_b: f32,
    selfcheck_failures: AtomicI32,
    rng: Mutex<ChaCha20Rng>,
}

impl Network {
    /// Load a weight file and bring up the forward pipes.
    pub fn initialize(weights_path: &str, config: InferenceConfig) -> Result<Self, EvalError> {
        let weights = load_weights(weights_path)?;
        info!(
            channels = weights.channels,
            blocks = weights.residual_blocks,
            "network initialized"
        );
        Ok(Self::from_weights(weights, config))
    }

    /// Bring up the pipes over already-loaded weights.
    pub fn from_weights(weights: ForwardPipeWeights, config: InferenceConfig) -> Self {
        let mut reference = CpuPipe::new();
        reference.initialize(weights.channels, 1);
        reference.push_weights(&weights);

        let mut device = CpuPipe::new();
        device.initialize(weights.channels, config.batch_size);
        device.push_weights(&weights);
        let pipes: Vec<Arc<dyn ForwardPipe>> = vec![Arc::new(device)];

        Self {
            scheduler: BatchScheduler::new(pipes, config),
            reference,
            ip2_val_w: weights.ip2_val_w.clone(),
            ip2_val_b: weights.ip2_val_b.first().copied().unwrap_or(0.0),
            selfcheck_failures: AtomicI32::new(0),
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(1111)),
        }
    }

    /// Mask, softmax and finish the raw head outputs.
    ///
    /// Any policy cell whose legality plane (input planes 32..48) reads
    /// below 0.5 is pushed to -1000 before the softmax, filtering noise on
    /// unreachable cells.
    fn postprocess(&self, input: &[f32], mut policy: Vec<f32>, mut value: Vec<f32>) -> (Vec<f32>, f32) {
        let legality = &input[32 * NUM_INTERSECTIONS..32 * NUM_INTERSECTIONS + OUTPUTS_POLICY];
        for (p, l) in policy.iter_mut().zip(legality.iter()) {
            if *l < 0.5 {
                *p -= 1000.0;
            }
        }
        let policy = softmax(&policy, 1.0);

        for v in &mut value {
            if *v < 0.0 {
                *v = 0.0;
            }
        }
        let mut winrate = self.ip2_val_b;
        for (w, v) in self.ip2_val_w.iter().zip(value.iter()) {
            winrate += w * v;
        }
        (policy, winrate.tanh())
    }

    fn run_selfcheck(&self, input: &[f32], policy: &[f32], winrate: f32) -> Result<(), EvalError> {
        let mut ref_pol = vec![0.0f32; OUTPUTS_POLICY];
        let mut ref_val = vec![0.0f32; OUTPUTS_VALUE];
        self.reference
            .forward(input, &mut ref_pol, &mut ref_val, 1)
            .map_err(|e| EvalError::Pipe(e.to_string()))?;
        let (ref_policy, ref_winrate) = self.postprocess(input, ref_pol, ref_val);

        let mut err = 0.0f32;
        for (a, b) in policy.iter().zip(ref_policy.iter()) {
            let d = a - b;
            err += d * d;
        }
        let dv = winrate - ref_winrate;
        err = (err + dv * dv).sqrt();

        if err > SELFCHECK_MAX_ERROR || err.is_nan() {
            let failures = self.selfcheck_failures.fetch_add(1, Ordering::AcqRel);
            warn!(error = err, failures, "self-check mismatch");
            if failures > SELFCHECK_MAX_FAILURES {
                error!("device output keeps diverging from the reference path");
                return Err(EvalError::SelfCheck);
            }
        } else {
            // One success forgives one earlier breach.
            let mut current = self.selfcheck_failures.load(Ordering::Acquire);
            while current > 0 {
                match self.selfcheck_failures.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
        Ok(())
    }
}

impl RawEvaluator for Network {
    fn evaluate_raw(&self, board: &mut Board) -> Result<EvalResult, EvalError> {
        let features = encode_input_features(board);

        let run_selfcheck = {
            let mut rng = self.rng.lock().expect("rng mutex");
            rng.gen_range(0..SELFCHECK_PERIOD) == 0
        };

        let (raw_pol, raw_val) = self
            .scheduler
            .forward(features.data.clone())
            .map_err(|e| EvalError::Pipe(e.to_string()))?;
        let (policy, winrate) = self.postprocess(&features.data, raw_pol, raw_val);

        if run_selfcheck {
            self.run_selfcheck(&features.data, &policy, winrate)?;
        }

        // Gather priors back into legal-move order via
        // (piece type, destination).
        let legal = board.legal_moves();
        let mut result = EvalResult {
            policy: Vec::with_capacity(legal.len()),
            value: winrate,
        };
        for &m in legal {
            let p = (m.piece & 0x0f) as usize;
            let cell = (m.to as usize / 10) * 9 + (m.to as usize % 10);
            result
                .policy
                .push((m, policy[p * NUM_INTERSECTIONS + cell]));
        }
        Ok(result)
    }
}

/// Numerically stable softmax.
fn softmax(input: &[f32], temperature: f32) -> Vec<f32> {
    let alpha = input.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut output: Vec<f32> = input
        .iter()
        .map(|&v| ((v - alpha) / temperature).exp())
        .collect();
    let denom: f32 = output.iter().sum();
    for v in &mut output {
        *v /= denom;
    }
    output
}
