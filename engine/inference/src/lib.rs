//! Position evaluation for the search.
//!
//! The public entry point is [`PositionEval`]: it encodes a board into
//! feature planes, consults a two-generation hash cache, and asks a raw
//! backend for anything not cached. The default backend is a material
//! heuristic; [`PositionEval::initialize`] swaps in a residual network
//! loaded from a weight file, fronted by a batching scheduler that
//! multiplexes all search threads onto the forward pipes.
//!
//! ```text
//! search threads ──> PositionEval ──(miss)──> Network ──> BatchScheduler
//!                        │                       │            │
//!                   16-bucket cache         self-check      CpuPipe(s)
//! ```

mod cpu;
mod evaluator;
mod features;
mod network;
mod pipe;
mod scheduler;
mod weights;

pub use cpu::CpuPipe;
pub use evaluator::{EvalError, EvalResult, MaterialEvaluator, PositionEval, RawEvaluator};
pub use features::{
    encode_input_features, encode_output_features, InputFeatures, OutputFeatures, INPUT_CHANNELS,
    OUTPUTS_POLICY, OUTPUTS_VALUE,
};
pub use network::Network;
pub use pipe::{ForwardPipe, PipeError};
pub use scheduler::BatchScheduler;
pub use weights::{load_weights, ForwardPipeWeights, WeightsError};

/// Playable intersections, re-exported for tensor sizing.
pub use janggi_core::NUM_INTERSECTIONS;
