//! Weight-file loading.
//!
//! The format is line-oriented text, optionally gzipped. The first line is a
//! version discriminator: 1 is a plain residual network, 5 adds two
//! squeeze-excitation lines to every second convolution of each residual
//! pair. The tower is 4 lines per convolution (weights, biases, batchnorm
//! means, batchnorm variances) followed by 14 head lines.
//!
//! On load, 3x3 filters are Winograd-transformed for the tiled GEMM path,
//! convolution biases are folded into the following batchnorm means, and
//! batchnorm variances are prescaled to `1/sqrt(var + eps)`.

use std::io::Read;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::features::{INPUT_CHANNELS, OUTPUTS_VALUE};

/// F(4x4, 3x3) Winograd tiling.
pub(crate) const WINOGRAD_M: usize = 4;
pub(crate) const WINOGRAD_ALPHA: usize = WINOGRAD_M + 3 - 1;
pub(crate) const WINOGRAD_TILE: usize = WINOGRAD_ALPHA * WINOGRAD_ALPHA;
/// Tiles per row; the 9x10 board needs 3 in each direction.
pub(crate) const WINOGRAD_WTILES: usize = (9 + WINOGRAD_M - 1) / WINOGRAD_M;
pub(crate) const WINOGRAD_P: usize = WINOGRAD_WTILES * WINOGRAD_WTILES;
pub(crate) const SQ2: f32 = std::f32::consts::SQRT_2;

#[derive(Debug, Error)]
pub enum WeightsError {
    #[error("could not open weights file: {0}")]
    Io(#[from] std::io::Error),

    #[error("weights file is not valid text")]
    NotText,

    #[error("weights file is the wrong version (got {0})")]
    BadVersion(String),

    #[error("inconsistent number of weight lines in the file")]
    InconsistentLineCount,

    #[error("failed to parse weights on line {0}")]
    Parse(usize),

    #[error("weight tensor has the wrong size on line {0}")]
    BadShape(usize),
}

/// Every tensor the forward pipes consume.
///
/// `conv_*` vectors hold the input convolution at index 0 followed by the
/// residual tower, two convolutions per block. `squeeze_*` lines are empty
/// for convolutions without a squeeze-excitation module.
#[derive(Debug, Default, Clone)]
pub struct ForwardPipeWeights {
    pub conv_weights: Vec<Vec<f32>>,
    pub conv_biases: Vec<Vec<f32>>,
    pub batchnorm_means: Vec<Vec<f32>>,
    pub batchnorm_stddevs: Vec<Vec<f32>>,
    pub squeeze_1: Vec<Vec<f32>>,
    pub squeeze_2: Vec<Vec<f32>>,

    pub conv_pol_w: Vec<f32>,
    pub conv_pol_b: Vec<f32>,
    pub bn_pol_w1: Vec<f32>,
    pub bn_pol_w2: Vec<f32>,
    pub ip_pol_w: Vec<f32>,
    pub ip_pol_b: Vec<f32>,

    pub conv_val_w: Vec<f32>,
    pub conv_val_b: Vec<f32>,
    pub bn_val_w1: Vec<f32>,
    pub bn_val_w2: Vec<f32>,
    pub ip_val_w: Vec<f32>,
    pub ip_val_b: Vec<f32>,

    /// Final value-head inner product, kept beside the pipe weights because
    /// it runs on the host after the batched forward.
    pub ip2_val_w: Vec<f32>,
    pub ip2_val_b: Vec<f32>,

    pub channels: usize,
    pub residual_blocks: usize,
}

fn process_bn_var(vars: &mut [f32]) {
    const EPSILON: f32 = 1e-5;
    for v in vars {
        *v = 1.0 / (*v + EPSILON).sqrt();
    }
}

/// F(4x4, 3x3) filter transform: `transpose(G . f . G^T)`, laid out
/// tile-major then `channels x outputs` for the tiled GEMM.
pub(crate) fn winograd_transform_f(f: &[f32], outputs: usize, channels: usize) -> Vec<f32> {
    debug_assert_eq!(f.len(), outputs * channels * 9);
    let mut u = vec![0.0f32; WINOGRAD_TILE * outputs * channels];

    #[rustfmt::skip]
    let g: [f32; 3 * WINOGRAD_ALPHA] = [
        1.0,        0.0,       0.0,
        -2.0 / 3.0, -SQ2 / 3.0, -1.0 / 3.0,
        -2.0 / 3.0,  SQ2 / 3.0, -1.0 / 3.0,
        1.0 / 6.0,   SQ2 / 6.0,  1.0 / 3.0,
        1.0 / 6.0,  -SQ2 / 6.0,  1.0 / 3.0,
        0.0,        0.0,       1.0,
    ];

    let mut temp = [0.0f32; 3 * WINOGRAD_ALPHA];
    for c in 0..channels {
        for o in 0..outputs {
            for i in 0..WINOGRAD_ALPHA {
                for j in 0..3 {
                    let mut acc = 0.0;
                    for k in 0..3 {
                        acc += g[i * 3 + k] * f[o * channels * 9 + c * 9 + k * 3 + j];
                    }
                    temp[i * 3 + j] = acc;
                }
            }
            for xi in 0..WINOGRAD_ALPHA {
                for nu in 0..WINOGRAD_ALPHA {
                    let mut acc = 0.0;
                    for k in 0..3 {
                        acc += temp[xi * 3 + k] * g[nu * 3 + k];
                    }
                    u[(xi * WINOGRAD_ALPHA + nu) * outputs * channels + c * outputs + o] = acc;
                }
            }
        }
    }
    u
}

fn read_text(path: &Path) -> Result<String, WeightsError> {
    let bytes = std::fs::read(path)?;
    if bytes.starts_with(&[0x1f, 0x8b]) {
        let mut text = String::new();
        flate2::read::GzDecoder::new(&bytes[..])
            .read_to_string(&mut text)
            .map_err(|_| WeightsError::NotText)?;
        Ok(text)
    } else {
        String::from_utf8(bytes).map_err(|_| WeightsError::NotText)
    }
}

fn parse_line(line: &str, lineno: usize) -> Result<Vec<f32>, WeightsError> {
    line.split_whitespace()
        .map(|tok| tok.parse::<f32>().map_err(|_| WeightsError::Parse(lineno)))
        .collect()
}

/// Load, parse and prepare a weight file for the forward pipes.
pub fn load_weights(path: impl AsRef<Path>) -> Result<ForwardPipeWeights, WeightsError> {
    let text = read_text(path.as_ref())?;
    let mut lines = text.lines();

    let version = lines.next().ok_or(WeightsError::InconsistentLineCount)?;
    let version = version.trim();
    let se = match version {
        "1" => false,
        "5" => true,
        other => return Err(WeightsError::BadVersion(other.to_string())),
    };

    let body: Vec<Vec<f32>> = lines
        .enumerate()
        .filter(|(_, l)| !l.trim().is_empty())
        .map(|(i, l)| parse_line(l, i + 2))
        .collect::<Result<_, _>>()?;

    // 1 input convolution (4 lines) and 14 head lines; the rest is residual
    // blocks at 8 lines each, or 10 with squeeze-excitation.
    let lines_per_block = if se { 10 } else { 8 };
    if body.len() < 18 || (body.len() - 18) % lines_per_block != 0 {
        return Err(WeightsError::InconsistentLineCount);
    }
    let residual_blocks = (body.len() - 18) / lines_per_block;
    let channels = body[1].len();
    info!(
        version,
        channels, residual_blocks, "detected residual network"
    );

    let mut w = ForwardPipeWeights {
        channels,
        residual_blocks,
        ..ForwardPipeWeights::default()
    };

    let plain_conv_layers = 1 + residual_blocks * 2;
    let tower_lines = plain_conv_layers * 4 + if se { residual_blocks * 2 } else { 0 };

    let mut residual_index = 0usize;
    for (i, line) in body.iter().enumerate() {
        let line = line.clone();
        if i < tower_lines {
            match residual_index % 6 {
                0 => {
                    w.conv_weights.push(line);
                    residual_index += 1;
                }
                1 => {
                    // Redundant once folded, but they encode the layer width.
                    w.conv_biases.push(line);
                    residual_index += 1;
                }
                2 => {
                    w.batchnorm_means.push(line);
                    residual_index += 1;
                }
                3 => {
                    let mut vars = line;
                    process_bn_var(&mut vars);
                    w.batchnorm_stddevs.push(vars);
                    residual_index += 1;
                    // The input convolution and the first convolution of
                    // each pair carry no squeeze-excitation lines.
                    let layer = residual_index / 6;
                    if !se || layer == 0 || layer % 2 == 1 {
                        w.squeeze_1.push(Vec::new());
                        w.squeeze_2.push(Vec::new());
                        residual_index += 2;
                    }
                }
                4 => {
                    w.squeeze_1.push(line);
                    residual_index += 1;
                }
                _ => {
                    w.squeeze_2.push(line);
                    residual_index += 1;
                }
            }
        } else {
            match i - tower_lines {
                0 => w.conv_pol_w = line,
                1 => w.conv_pol_b = line,
                2 => w.bn_pol_w1 = line,
                3 => w.bn_pol_w2 = line,
                4 => w.ip_pol_w = line,
                5 => w.ip_pol_b = line,
                6 => w.conv_val_w = line,
                7 => w.conv_val_b = line,
                8 => w.bn_val_w1 = line,
                9 => w.bn_val_w2 = line,
                10 => w.ip_val_w = line,
                11 => w.ip_val_b = line,
                12 => w.ip2_val_w = line,
                13 => w.ip2_val_b = line,
                _ => return Err(WeightsError::InconsistentLineCount),
            }
        }
    }

    if w.ip2_val_w.len() != OUTPUTS_VALUE || w.ip2_val_b.len() != 1 {
        return Err(WeightsError::BadShape(body.len() + 1));
    }
    for (idx, conv) in w.conv_weights.iter().enumerate() {
        let in_ch = if idx == 0 { INPUT_CHANNELS } else { channels };
        if conv.len() != channels * in_ch * 9 {
            return Err(WeightsError::BadShape(idx + 2));
        }
    }

    process_bn_var(&mut w.bn_pol_w2);
    process_bn_var(&mut w.bn_val_w2);

    // Winograd-transform the 3x3 tower.
    w.conv_weights[0] = winograd_transform_f(&w.conv_weights[0], channels, INPUT_CHANNELS);
    for i in 1..=residual_blocks * 2 {
        w.conv_weights[i] = winograd_transform_f(&w.conv_weights[i], channels, channels);
    }

    // Fold biases into the batchnorm means so the pipes skip the adds.
    for i in 0..w.conv_biases.len() {
        for j in 0..w.batchnorm_means[i].len() {
            w.batchnorm_means[i][j] -= w.conv_biases[i][j];
            w.conv_biases[i][j] = 0.0;
        }
    }
    for i in 0..w.bn_val_w1.len() {
        w.bn_val_w1[i] -= w.conv_val_b[i];
        w.conv_val_b[i] = 0.0;
    }
    for i in 0..w.bn_pol_w1.len() {
        w.bn_pol_w1[i] -= w.conv_pol_b[i];
        w.conv_pol_b[i] = 0.0;
    }

    Ok(w)
}

/// All-zero network with consistent shapes (post-transform layout), for
/// exercising the forward plumbing without a weight file.
#[cfg(test)]
pub(crate) fn zero_weights(channels: usize) -> ForwardPipeWeights {
    use crate::features::OUTPUTS_POLICY;
    use janggi_core::NUM_INTERSECTIONS;

    let ch = channels;
    ForwardPipeWeights {
        conv_weights: vec![
            vec![0.0; WINOGRAD_TILE * ch * INPUT_CHANNELS],
            vec![0.0; WINOGRAD_TILE * ch * ch],
            vec![0.0; WINOGRAD_TILE * ch * ch],
        ],
        conv_biases: vec![vec![0.0; ch]; 3],
        batchnorm_means: vec![vec![0.0; ch]; 3],
        batchnorm_stddevs: vec![vec![1.0; ch]; 3],
        squeeze_1: vec![Vec::new(); 3],
        squeeze_2: vec![Vec::new(); 3],
        conv_pol_w: vec![0.0; 16 * ch],
        conv_pol_b: vec![0.0; 16],
        bn_pol_w1: vec![0.0; 16],
        bn_pol_w2: vec![1.0; 16],
        ip_pol_w: vec![0.0; OUTPUTS_POLICY * OUTPUTS_POLICY],
        ip_pol_b: vec![0.0; OUTPUTS_POLICY],
        conv_val_w: vec![0.0; ch],
        conv_val_b: vec![0.0; 1],
        bn_val_w1: vec![0.0; 1],
        bn_val_w2: vec![1.0; 1],
        ip_val_w: vec![0.0; OUTPUTS_VALUE * NUM_INTERSECTIONS],
        ip_val_b: vec![0.0; OUTPUTS_VALUE],
        ip2_val_w: vec![0.0; OUTPUTS_VALUE],
        ip2_val_b: vec![0.0; 1],
        channels: ch,
        residual_blocks: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn line_of(n: usize, v: f32) -> String {
        let mut s = String::with_capacity(n * 4);
        for i in 0..n {
            if i > 0 {
                s.push(' ');
            }
            s.push_str(&format!("{}", v));
        }
        s
    }

    /// Minimal consistent v1 net: 2 channels, 1 residual block. Head FC
    /// lines are not shape-checked by the loader, so short stand-ins do.
    fn tiny_v1_text() -> String {
        let ch = 2;
        let mut lines = vec!["1".to_string()];
        // Input convolution.
        lines.push(line_of(ch * INPUT_CHANNELS * 9, 0.5));
        lines.push(line_of(ch, 0.25));
        lines.push(line_of(ch, 0.0));
        lines.push(line_of(ch, 1.0));
        // One residual block: two convolutions.
        for _ in 0..2 {
            lines.push(line_of(ch * ch * 9, 0.5));
            lines.push(line_of(ch, 0.0));
            lines.push(line_of(ch, 0.0));
            lines.push(line_of(ch, 1.0));
        }
        // Heads.
        lines.push(line_of(16 * ch, 0.1)); // conv_pol_w
        lines.push(line_of(16, 0.0)); // conv_pol_b
        lines.push(line_of(16, 0.0)); // bn_pol_w1
        lines.push(line_of(16, 1.0)); // bn_pol_w2
        lines.push(line_of(8, 0.0)); // ip_pol_w (stand-in)
        lines.push(line_of(8, 0.0)); // ip_pol_b (stand-in)
        lines.push(line_of(ch, 0.1)); // conv_val_w
        lines.push(line_of(1, 0.5)); // conv_val_b
        lines.push(line_of(1, 0.25)); // bn_val_w1
        lines.push(line_of(1, 1.0)); // bn_val_w2
        lines.push(line_of(8, 0.0)); // ip_val_w (stand-in)
        lines.push(line_of(8, 0.0)); // ip_val_b (stand-in)
        lines.push(line_of(OUTPUTS_VALUE, 0.0)); // ip2_val_w
        lines.push(line_of(1, 0.0)); // ip2_val_b
        lines.join("\n")
    }

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn loads_plain_v1_file() {
        let f = write_temp(tiny_v1_text().as_bytes());
        let w = load_weights(f.path()).unwrap();

        assert_eq!(w.channels, 2);
        assert_eq!(w.residual_blocks, 1);
        assert_eq!(w.conv_weights.len(), 3);
        assert_eq!(w.squeeze_1.len(), 3);
        assert!(w.squeeze_1.iter().all(|s| s.is_empty()));

        // Transformed filters expand 3x3 to the 6x6 tile basis.
        assert_eq!(w.conv_weights[0].len(), WINOGRAD_TILE * 2 * INPUT_CHANNELS);
        assert_eq!(w.conv_weights[1].len(), WINOGRAD_TILE * 2 * 2);

        // Bias folding: means absorbed the conv biases and biases zeroed.
        assert!(w.conv_biases[0].iter().all(|&b| b == 0.0));
        assert!((w.batchnorm_means[0][0] - (0.0 - 0.25)).abs() < 1e-6);
        assert!((w.bn_val_w1[0] - (0.25 - 0.5)).abs() < 1e-6);

        // Variance prescaling.
        let expected = 1.0 / (1.0f32 + 1e-5).sqrt();
        assert!((w.batchnorm_stddevs[0][0] - expected).abs() < 1e-6);
    }

    #[test]
    fn loads_gzipped_file() {
        use flate2::write::GzEncoder;
        use flate2::Compression;

        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(tiny_v1_text().as_bytes()).unwrap();
        let gz = enc.finish().unwrap();

        let f = write_temp(&gz);
        let w = load_weights(f.path()).unwrap();
        assert_eq!(w.channels, 2);
        assert_eq!(w.residual_blocks, 1);
    }

    #[test]
    fn rejects_wrong_version() {
        let f = write_temp(b"3\n1 2 3\n");
        assert!(matches!(
            load_weights(f.path()),
            Err(WeightsError::BadVersion(_))
        ));
    }

    #[test]
    fn rejects_inconsistent_line_count() {
        let mut text = tiny_v1_text();
        text.push_str("\n1 2 3");
        let f = write_temp(text.as_bytes());
        assert!(matches!(
            load_weights(f.path()),
            Err(WeightsError::InconsistentLineCount)
        ));
    }

    #[test]
    fn rejects_malformed_floats() {
        let text = tiny_v1_text().replace("0.25", "zebra");
        let f = write_temp(text.as_bytes());
        assert!(matches!(load_weights(f.path()), Err(WeightsError::Parse(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(
            load_weights("/no/such/weights.txt"),
            Err(WeightsError::Io(_))
        ));
    }

    #[test]
    fn v5_interleaves_squeeze_lines() {
        let ch = 8;
        let mut lines = vec!["5".to_string()];
        lines.push(line_of(ch * INPUT_CHANNELS * 9, 0.1));
        for _ in 0..3 {
            lines.push(line_of(ch, 0.0));
        }
        // Block: first conv plain, second conv carries SE lines.
        lines.push(line_of(ch * ch * 9, 0.1));
        for _ in 0..3 {
            lines.push(line_of(ch, 0.0));
        }
        lines.push(line_of(ch * ch * 9, 0.1));
        for _ in 0..3 {
            lines.push(line_of(ch, 0.0));
        }
        lines.push(line_of(ch * (ch / 8), 0.2)); // squeeze 1
        lines.push(line_of((ch / 8) * ch, 0.2)); // squeeze 2
        // Heads.
        for n in [16 * ch, 16, 16, 16, 8, 8, ch, 1, 1, 1, 8, 8] {
            lines.push(line_of(n, 0.0));
        }
        lines.push(line_of(OUTPUTS_VALUE, 0.0));
        lines.push(line_of(1, 0.0));

        let f = write_temp(lines.join("\n").as_bytes());
        let w = load_weights(f.path()).unwrap();

        assert_eq!(w.residual_blocks, 1);
        assert_eq!(w.channels, 8);
        assert_eq!(w.squeeze_1.len(), 3);
        assert!(w.squeeze_1[0].is_empty());
        assert!(w.squeeze_1[1].is_empty());
        assert_eq!(w.squeeze_1[2].len(), 8);
        assert_eq!(w.squeeze_2[2].len(), 8);
    }
}
