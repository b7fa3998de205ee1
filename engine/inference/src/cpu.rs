//! Deterministic host forward path.
//!
//! Runs the residual tower through F(4x4, 3x3) Winograd convolutions (one
//! GEMM per tile position), then the 1x1 head convolutions and fully
//! connected layers. This pipe doubles as the reference for the accelerator
//! self-check, so it must stay bit-stable across runs.

use std::sync::Arc;

use ndarray::ArrayView2;

use janggi_core::{BOARD_H, BOARD_W, NUM_INTERSECTIONS};

use crate::features::{INPUT_CHANNELS, OUTPUTS_POLICY, OUTPUTS_VALUE};
use crate::pipe::{ForwardPipe, PipeError};
use crate::weights::{
    ForwardPipeWeights, SQ2, WINOGRAD_ALPHA, WINOGRAD_M, WINOGRAD_P, WINOGRAD_TILE, WINOGRAD_WTILES,
};

/// Host implementation of [`ForwardPipe`].
#[derive(Default)]
pub struct CpuPipe {
    channels: usize,
    weights: Option<Arc<ForwardPipeWeights>>,
}

impl CpuPipe {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Multiply a 6-vector by B^T (the input-tile transform).
#[inline]
#[allow(clippy::many_single_char_names)]
fn multiply_bt(i: [f32; 6]) -> [f32; 6] {
    let i3m1 = i[1] * -SQ2 + i[3] * (SQ2 / 2.0);
    let i4m2 = i[2] * -2.0 + i[4];
    let i3m1_2 = i[3] * SQ2 + i[1] * (-SQ2 / 2.0);
    let i4m2_2 = i[2] * (-1.0 / 2.0) + i[4];
    [
        i[0] + i[2] * (-5.0 / 2.0) + i[4],
        i3m1 + i4m2,
        -i3m1 + i4m2,
        i3m1_2 + i4m2_2,
        -i3m1_2 + i4m2_2,
        i[1] + i[3] * (-5.0 / 2.0) + i[5],
    ]
}

/// Multiply a 6-vector by A^T (the output-tile transform).
#[inline]
fn multiply_at(i: [f32; 6]) -> [f32; 4] {
    let t1p2 = (i[1] + i[2]) * (1.0 / 2.0);
    let t1m2 = (i[1] - i[2]) * (SQ2 / 4.0);
    let t3p4 = i[3] + i[4];
    let t3m4 = (i[3] - i[4]) * SQ2;
    [
        i[0] + t1p2 + t1p2 + t3p4,
        t1m2 + t1m2 + t3m4,
        t1p2 + t3p4 + t3p4,
        t1m2 + t3m4 + t3m4 + i[5],
    ]
}

/// Scatter the input into the 6x6 tile basis: `V[tile][channel][block]`.
fn winograd_transform_in(input: &[f32], v: &mut [f32], channels: usize) {
    const WPAD: usize = 2 + WINOGRAD_M * WINOGRAD_WTILES;
    let p = WINOGRAD_P;

    let mut pad = [[0.0f32; WPAD]; WPAD];
    for (ch, chunk) in input.chunks_exact(NUM_INTERSECTIONS).enumerate().take(channels) {
        for y in 0..BOARD_H {
            for x in 0..BOARD_W {
                pad[y + 1][x + 1] = chunk[y * BOARD_W + x];
            }
        }

        for block_y in 0..WINOGRAD_WTILES {
            let yin = WINOGRAD_M * block_y;
            for block_x in 0..WINOGRAD_WTILES {
                let xin = WINOGRAD_M * block_x;

                // Columns first, then rows: transpose(B) . x . B.
                let mut t1 = [[0.0f32; 6]; 6];
                for col in 0..WINOGRAD_ALPHA {
                    let column = [
                        pad[yin][xin + col],
                        pad[yin + 1][xin + col],
                        pad[yin + 2][xin + col],
                        pad[yin + 3][xin + col],
                        pad[yin + 4][xin + col],
                        pad[yin + 5][xin + col],
                    ];
                    let out = multiply_bt(column);
                    for (row, val) in out.into_iter().enumerate() {
                        t1[row][col] = val;
                    }
                }

                let block = block_y * WINOGRAD_WTILES + block_x;
                for (row, vals) in t1.iter().enumerate() {
                    let out = multiply_bt(*vals);
                    for (nu, val) in out.into_iter().enumerate() {
                        v[(row * WINOGRAD_ALPHA + nu) * channels * p + ch * p + block] = val;
                    }
                }
            }
        }
    }
}

/// One GEMM per tile position: `M_b = V_b^T . U_b` in `[K][P]` layout.
fn winograd_sgemm(u: &[f32], v: &[f32], m: &mut [f32], channels: usize, outputs: usize) {
    let p = WINOGRAD_P;
    for b in 0..WINOGRAD_TILE {
        let u_b = ArrayView2::from_shape((channels, outputs), &u[b * outputs * channels..][..outputs * channels])
            .expect("U tile shape");
        let v_b = ArrayView2::from_shape((channels, p), &v[b * channels * p..][..channels * p])
            .expect("V tile shape");
        let m_b = u_b.t().dot(&v_b);
        m[b * outputs * p..][..outputs * p].copy_from_slice(m_b.as_standard_layout().as_slice().expect("contiguous"));
    }
}

/// Gather tiles back into `[K][H][W]` activations.
fn winograd_transform_out(m: &[f32], output: &mut [f32], outputs: usize) {
    let p = WINOGRAD_P;
    for k in 0..outputs {
        for block_x in 0..WINOGRAD_WTILES {
            let x = WINOGRAD_M * block_x;
            for block_y in 0..WINOGRAD_WTILES {
                let y = WINOGRAD_M * block_y;
                let b = block_y * WINOGRAD_WTILES + block_x;

                let mut temp_m = [[0.0f32; 6]; 6];
                for (xi, row) in temp_m.iter_mut().enumerate() {
                    for (nu, val) in row.iter_mut().enumerate() {
                        *val = m[(xi * WINOGRAD_ALPHA + nu) * outputs * p + k * p + b];
                    }
                }

                // transpose(A) . temp_m . A
                let mut temp = [[0.0f32; 6]; 4];
                for j in 0..WINOGRAD_ALPHA {
                    let column = [
                        temp_m[0][j], temp_m[1][j], temp_m[2][j], temp_m[3][j], temp_m[4][j],
                        temp_m[5][j],
                    ];
                    let out = multiply_at(column);
                    for (row, val) in out.into_iter().enumerate() {
                        temp[row][j] = val;
                    }
                }

                for (i, row) in temp.iter().enumerate() {
                    let out = multiply_at(*row);
                    for (j, val) in out.into_iter().enumerate() {
                        if y + i < BOARD_H && x + j < BOARD_W {
                            output[k * NUM_INTERSECTIONS + (y + i) * BOARD_W + x + j] = val;
                        }
                    }
                }
            }
        }
    }
}

fn winograd_convolve3(
    outputs: usize,
    input: &[f32],
    u: &[f32],
    v: &mut [f32],
    m: &mut [f32],
    output: &mut [f32],
) {
    let channels = u.len() / (outputs * WINOGRAD_TILE);
    winograd_transform_in(input, v, channels);
    winograd_sgemm(u, v, m, channels, outputs);
    winograd_transform_out(m, output, outputs);
}

/// 1x1 convolution: a plain GEMM over the spatial dimension, plus biases.
fn convolve1(outputs: usize, input: &[f32], weights: &[f32], biases: &[f32], output: &mut [f32]) {
    let channels = weights.len() / outputs;
    let w = ArrayView2::from_shape((outputs, channels), weights).expect("conv1 weight shape");
    let x = ArrayView2::from_shape((channels, NUM_INTERSECTIONS), &input[..channels * NUM_INTERSECTIONS])
        .expect("conv1 input shape");
    let y = w.dot(&x);
    output.copy_from_slice(y.as_standard_layout().as_slice().expect("contiguous"));
    for (o, bias) in biases.iter().enumerate().take(outputs) {
        for cell in &mut output[o * NUM_INTERSECTIONS..(o + 1) * NUM_INTERSECTIONS] {
            *cell += bias;
        }
    }
}

/// Fully connected layer; weights are `[outputs][inputs]` row-major.
fn innerproduct(input: &[f32], weights: &[f32], biases: &[f32], relu: bool) -> Vec<f32> {
    let outputs = biases.len();
    let inputs = input.len();
    let w = ArrayView2::from_shape((outputs, inputs), &weights[..outputs * inputs])
        .expect("fc weight shape");
    let x = ndarray::ArrayView1::from(input);
    let mut y = w.dot(&x).to_vec();
    for (o, val) in y.iter_mut().enumerate() {
        *val += biases[o];
        if relu && *val < 0.0 {
            *val = 0.0;
        }
    }
    y
}

fn batchnorm(channels: usize, data: &mut [f32], means: &[f32], stddevs: &[f32]) {
    for c in 0..channels {
        let mean = means[c];
        let scale = stddevs[c];
        for v in &mut data[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS] {
            *v = scale * (*v - mean);
        }
    }
}

fn relu_inplace(data: &mut [f32]) {
    for v in data {
        if *v < 0.0 {
            *v = 0.0;
        }
    }
}

/// Squeeze-excitation: per-channel average, bottleneck FC pair, sigmoid
/// gate, channel scale.
fn squeeze_excite(channels: usize, data: &mut [f32], w1: &[f32], w2: &[f32]) {
    let mid_len = channels / 8;

    let mut avg = Vec::with_capacity(channels);
    for c in 0..channels {
        let sum: f32 = data[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS].iter().sum();
        avg.push(sum / NUM_INTERSECTIONS as f32);
    }

    let mut mid = vec![0.0f32; mid_len];
    for (y, m) in mid.iter_mut().enumerate() {
        let mut acc = 0.0;
        for (x, a) in avg.iter().enumerate() {
            acc += a * w1[y * channels + x];
        }
        *m = acc.max(0.0);
    }

    for c in 0..channels {
        let mut acc = 0.0;
        for (x, m) in mid.iter().enumerate() {
            acc += m * w2[c * mid_len + x];
        }
        let gate = 1.0 / (1.0 + (-acc).exp());
        for v in &mut data[c * NUM_INTERSECTIONS..(c + 1) * NUM_INTERSECTIONS] {
            *v *= gate;
        }
    }
}

fn eltwise_add(data: &mut [f32], res: &[f32]) {
    for (d, r) in data.iter_mut().zip(res.iter()) {
        *d += r;
    }
}

impl CpuPipe {
    /// Forward one sample.
    fn forward_one(
        &self,
        weights: &ForwardPipeWeights,
        input: &[f32],
        out_pol: &mut [f32],
        out_val: &mut [f32],
    ) {
        let channels = self.channels;
        let input_channels = channels.max(INPUT_CHANNELS);

        let mut conv_out = vec![0.0f32; channels * NUM_INTERSECTIONS];
        let mut v = vec![0.0f32; WINOGRAD_TILE * input_channels * WINOGRAD_P];
        let mut m = vec![0.0f32; WINOGRAD_TILE * channels * WINOGRAD_P];

        winograd_convolve3(
            channels,
            input,
            &weights.conv_weights[0],
            &mut v,
            &mut m,
            &mut conv_out,
        );
        batchnorm(
            channels,
            &mut conv_out,
            &weights.batchnorm_means[0],
            &weights.batchnorm_stddevs[0],
        );
        relu_inplace(&mut conv_out);

        let mut conv_in = vec![0.0f32; channels * NUM_INTERSECTIONS];
        let mut res = vec![0.0f32; channels * NUM_INTERSECTIONS];
        let mut i = 1;
        while i < weights.conv_weights.len() {
            std::mem::swap(&mut conv_out, &mut conv_in);
            winograd_convolve3(
                channels,
                &conv_in,
                &weights.conv_weights[i],
                &mut v,
                &mut m,
                &mut conv_out,
            );
            batchnorm(
                channels,
                &mut conv_out,
                &weights.batchnorm_means[i],
                &weights.batchnorm_stddevs[i],
            );
            relu_inplace(&mut conv_out);

            std::mem::swap(&mut conv_in, &mut res);
            std::mem::swap(&mut conv_out, &mut conv_in);
            winograd_convolve3(
                channels,
                &conv_in,
                &weights.conv_weights[i + 1],
                &mut v,
                &mut m,
                &mut conv_out,
            );
            batchnorm(
                channels,
                &mut conv_out,
                &weights.batchnorm_means[i + 1],
                &weights.batchnorm_stddevs[i + 1],
            );
            if !weights.squeeze_1[i + 1].is_empty() {
                squeeze_excite(
                    channels,
                    &mut conv_out,
                    &weights.squeeze_1[i + 1],
                    &weights.squeeze_2[i + 1],
                );
            }
            eltwise_add(&mut conv_out, &res);
            relu_inplace(&mut conv_out);

            i += 2;
        }

        // Heads.
        let mut policy_data = vec![0.0f32; 16 * NUM_INTERSECTIONS];
        let mut value_data = vec![0.0f32; NUM_INTERSECTIONS];
        convolve1(
            16,
            &conv_out,
            &weights.conv_pol_w,
            &weights.conv_pol_b,
            &mut policy_data,
        );
        convolve1(
            1,
            &conv_out,
            &weights.conv_val_w,
            &weights.conv_val_b,
            &mut value_data,
        );

        batchnorm(16, &mut policy_data, &weights.bn_pol_w1, &weights.bn_pol_w2);
        relu_inplace(&mut policy_data);
        out_pol.copy_from_slice(&innerproduct(
            &policy_data,
            &weights.ip_pol_w,
            &weights.ip_pol_b,
            false,
        ));

        batchnorm(1, &mut value_data, &weights.bn_val_w1, &weights.bn_val_w2);
        relu_inplace(&mut value_data);
        out_val.copy_from_slice(&innerproduct(
            &value_data,
            &weights.ip_val_w,
            &weights.ip_val_b,
            true,
        ));
    }
}

impl ForwardPipe for CpuPipe {
    fn initialize(&mut self, channels: usize, _batch_size: usize) {
        self.channels = channels;
    }

    fn push_weights(&mut self, weights: &ForwardPipeWeights) {
        self.weights = Some(Arc::new(weights.clone()));
    }

    fn forward(
        &self,
        input: &[f32],
        out_pol: &mut [f32],
        out_val: &mut [f32],
        count: usize,
    ) -> Result<(), PipeError> {
        let weights = self.weights.as_ref().ok_or(PipeError::NotInitialized)?;
        let in_size = INPUT_CHANNELS * NUM_INTERSECTIONS;

        for b in 0..count {
            self.forward_one(
                weights,
                &input[b * in_size..(b + 1) * in_size],
                &mut out_pol[b * OUTPUTS_POLICY..(b + 1) * OUTPUTS_POLICY],
                &mut out_val[b * OUTPUTS_VALUE..(b + 1) * OUTPUTS_VALUE],
            );
        }
        Ok(())
    }
}
