//! The forward-pipe contract every inference backend honors.

use thiserror::Error;

use crate::weights::ForwardPipeWeights;

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("forward pipe not initialized")]
    NotInitialized,

    #[error("backend failure: {0}")]
    Backend(String),
}

/// A device (or host) forward path for the residual network.
///
/// `forward` consumes `count` stacked samples: input is
/// `count * 66 * 90` floats, the policy output `count * 16 * 90` and the
/// value output `count * 256`. Implementations must be safe to call from
/// multiple scheduler workers at once.
pub trait ForwardPipe: Send + Sync {
    /// Prepare for `channels`-wide towers and batches up to `batch_size`.
    fn initialize(&mut self, channels: usize, batch_size: usize);

    /// Install (already Winograd-transformed) weights.
    fn push_weights(&mut self, weights: &ForwardPipeWeights);

    /// Run a batch of `count` samples.
    fn forward(
        &self,
        input: &[f32],
        out_pol: &mut [f32],
        out_val: &mut [f32],
        count: usize,
    ) -> Result<(), PipeError>;
}
