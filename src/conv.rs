//! Grouped, strided, dilated 2D convolution over NCHW tensors.
//!
//! Forward unfolds each sample into a column matrix (im2col) and runs one
//! GEMM per group; samples are processed in parallel. The backward pass is
//! recorded on the tape and produces input, weight and bias gradients.
//!
//! Padding is never materialized: every kernel tap resolves its source
//! coordinate through the [`PaddingMode`], so `Reflect`, `Replicate` and
//! `Circular` share the zero-padding code path.

use crate::error::{QatError, Result};
use crate::gemm::{n, sgemm_rowmajor, t};
use crate::{ops, tape::Tape, Tensor};
use rayon::prelude::*;

/// How positions outside the input are filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PaddingMode {
    #[default]
    Zeros,
    Reflect,
    Replicate,
    Circular,
}

impl PaddingMode {
    /// Maps a coordinate on the padded axis back onto `0..len`, or `None` for a zero.
    fn resolve(self, pos: isize, len: usize) -> Option<usize> {
        let len_i = len as isize;
        if (0..len_i).contains(&pos) {
            return Some(pos as usize);
        }
        match self {
            PaddingMode::Zeros => None,
            PaddingMode::Circular => Some(pos.rem_euclid(len_i) as usize),
            PaddingMode::Replicate => Some(pos.clamp(0, len_i - 1) as usize),
            PaddingMode::Reflect => {
                if len == 1 {
                    return Some(0);
                }
                let period = 2 * (len_i - 1);
                let m = pos.rem_euclid(period);
                Some(if m < len_i { m } else { period - m } as usize)
            }
        }
    }
}

/// Stride, padding, dilation, groups and padding policy of one convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub padding_mode: PaddingMode,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            padding_mode: PaddingMode::Zeros,
        }
    }
}

impl ConvGeometry {
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_padding_mode(mut self, padding_mode: PaddingMode) -> Self {
        self.padding_mode = padding_mode;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.groups == 0 {
            return Err(QatError::InvalidConfig("groups must be positive".into()));
        }
        if self.stride.0 == 0 || self.stride.1 == 0 {
            return Err(QatError::InvalidConfig(format!(
                "stride must be positive, got {:?}",
                self.stride
            )));
        }
        if self.dilation.0 == 0 || self.dilation.1 == 0 {
            return Err(QatError::InvalidConfig(format!(
                "dilation must be positive, got {:?}",
                self.dilation
            )));
        }
        Ok(())
    }

    /// Output spatial size for an `h×w` input and `kh×kw` kernel.
    pub fn output_size(
        &self,
        (h, w): (usize, usize),
        (kh, kw): (usize, usize),
    ) -> Option<(usize, usize)> {
        let axis = |len: usize, k: usize, pad: usize, dil: usize, stride: usize| {
            let padded = len + 2 * pad;
            let span = dil * (k.checked_sub(1)?) + 1;
            padded.checked_sub(span).map(|r| r / stride + 1)
        };
        Some((
            axis(h, kh, self.padding.0, self.dilation.0, self.stride.0)?,
            axis(w, kw, self.padding.1, self.dilation.1, self.stride.1)?,
        ))
    }
}

/// Resolved dimensions plus the source index of every kernel tap.
struct ConvPlan {
    batch: usize,
    in_channels: usize,
    height: usize,
    width: usize,
    out_channels: usize,
    group_in: usize,
    group_out: usize,
    groups: usize,
    kernel: (usize, usize),
    out_h: usize,
    out_w: usize,
    // [(ki * kw + kj) * L + oy * out_w + ox] -> spatial index in an input plane
    taps: Vec<Option<usize>>,
}

impl ConvPlan {
    fn new(
        input: &[usize],
        weight: &[usize],
        bias: Option<&[usize]>,
        geometry: &ConvGeometry,
    ) -> Result<Self> {
        geometry.validate()?;

        let &[batch, in_channels, height, width] = input else {
            return Err(QatError::ShapeMismatch(format!(
                "expected 4D input [N, C, H, W], got {input:?}"
            )));
        };
        let &[out_channels, group_in, kh, kw] = weight else {
            return Err(QatError::ShapeMismatch(format!(
                "expected 4D weight [O, C/groups, kH, kW], got {weight:?}"
            )));
        };
        let groups = geometry.groups;

        if out_channels == 0 || group_in == 0 || kh == 0 || kw == 0 {
            return Err(QatError::ShapeMismatch(format!(
                "weight has an empty dimension: {weight:?}"
            )));
        }
        if group_in * groups != in_channels {
            return Err(QatError::ShapeMismatch(format!(
                "input has {in_channels} channels, weight {weight:?} with groups={groups} \
                 expects {}",
                group_in * groups
            )));
        }
        if out_channels % groups != 0 {
            return Err(QatError::ShapeMismatch(format!(
                "out_channels ({out_channels}) not divisible by groups ({groups})"
            )));
        }
        if let Some(bias) = bias {
            if bias != [out_channels] {
                return Err(QatError::ShapeMismatch(format!(
                    "bias shape {bias:?} does not match out_channels {out_channels}"
                )));
            }
        }
        if height == 0 || width == 0 {
            return Err(QatError::ShapeMismatch(format!(
                "input has an empty spatial dimension: {input:?}"
            )));
        }

        let (ph, pw) = geometry.padding;
        match geometry.padding_mode {
            PaddingMode::Reflect if ph >= height || pw >= width => {
                return Err(QatError::ShapeMismatch(format!(
                    "reflect padding {:?} must be smaller than input size ({height}, {width})",
                    geometry.padding
                )));
            }
            PaddingMode::Circular if ph > height || pw > width => {
                return Err(QatError::ShapeMismatch(format!(
                    "circular padding {:?} exceeds input size ({height}, {width})",
                    geometry.padding
                )));
            }
            _ => {}
        }

        let (out_h, out_w) = geometry
            .output_size((height, width), (kh, kw))
            .ok_or_else(|| {
                QatError::ShapeMismatch(format!(
                    "padded input ({}, {}) is smaller than dilated kernel ({}, {})",
                    height + 2 * ph,
                    width + 2 * pw,
                    geometry.dilation.0 * (kh - 1) + 1,
                    geometry.dilation.1 * (kw - 1) + 1
                ))
            })?;

        let (sh, sw) = geometry.stride;
        let (dh, dw) = geometry.dilation;
        let mode = geometry.padding_mode;
        let mut taps = Vec::with_capacity(kh * kw * out_h * out_w);
        for ki in 0..kh {
            for kj in 0..kw {
                for oy in 0..out_h {
                    let iy = (oy * sh + ki * dh) as isize - ph as isize;
                    let row = mode.resolve(iy, height);
                    for ox in 0..out_w {
                        let ix = (ox * sw + kj * dw) as isize - pw as isize;
                        let tap = row.zip(mode.resolve(ix, width)).map(|(r, c)| r * width + c);
                        taps.push(tap);
                    }
                }
            }
        }

        Ok(Self {
            batch,
            in_channels,
            height,
            width,
            out_channels,
            group_in,
            group_out: out_channels / groups,
            groups,
            kernel: (kh, kw),
            out_h,
            out_w,
            taps,
        })
    }

    fn sample_len(&self) -> usize {
        self.in_channels * self.height * self.width
    }

    fn out_spatial(&self) -> usize {
        self.out_h * self.out_w
    }

    fn patch_len(&self) -> usize {
        self.group_in * self.kernel.0 * self.kernel.1
    }

    /// Unfold the channels of group `g` of one sample into `col` (patch_len × L).
    fn im2col(&self, sample: &[f32], g: usize, col: &mut [f32]) {
        let plane = self.height * self.width;
        let l = self.out_spatial();
        let kk = self.kernel.0 * self.kernel.1;
        for icl in 0..self.group_in {
            let src = &sample[(g * self.group_in + icl) * plane..][..plane];
            for k in 0..kk {
                let dst = &mut col[(icl * kk + k) * l..][..l];
                let taps = &self.taps[k * l..][..l];
                for (d, tap) in dst.iter_mut().zip(taps) {
                    *d = tap.map_or(0.0, |s| src[s]);
                }
            }
        }
    }

    /// Scatter-add a column-matrix gradient back onto one sample's input gradient.
    fn col2im(&self, col: &[f32], g: usize, sample_grad: &mut [f32]) {
        let plane = self.height * self.width;
        let l = self.out_spatial();
        let kk = self.kernel.0 * self.kernel.1;
        for icl in 0..self.group_in {
            let dst = &mut sample_grad[(g * self.group_in + icl) * plane..][..plane];
            for k in 0..kk {
                let src = &col[(icl * kk + k) * l..][..l];
                let taps = &self.taps[k * l..][..l];
                for (&v, tap) in src.iter().zip(taps) {
                    if let Some(s) = tap {
                        dst[*s] += v;
                    }
                }
            }
        }
    }
}

/// 2D convolution: `[N, C, H, W] ⊛ [O, C/groups, kH, kW] (+ bias[O]) -> [N, O, oH, oW]`.
///
/// Fails with [`QatError::ShapeMismatch`] on incompatible channel or kernel
/// dimensions and [`QatError::InvalidConfig`] on a zero stride, dilation or
/// group count.
pub fn conv2d(
    input: &Tensor,
    weight: &Tensor,
    bias: Option<&Tensor>,
    geometry: &ConvGeometry,
) -> Result<Tensor> {
    let plan = ConvPlan::new(input.shape(), weight.shape(), bias.map(|b| b.shape()), geometry)?;

    let l = plan.out_spatial();
    let k = plan.patch_len();
    let ocg = plan.group_out;
    let per_sample = plan.out_channels * l;
    let mut result = vec![0.0f32; plan.batch * per_sample];

    {
        let x_ref = input.data();
        let w_ref = weight.data();
        let b_ref = bias.map(|b| b.data());
        let x: &[f32] = &x_ref;
        let w: &[f32] = &w_ref;
        let b: Option<&[f32]> = b_ref.as_deref().map(|v| v.as_slice());
        let plan = &plan;

        result
            .par_chunks_mut(per_sample)
            .enumerate()
            .for_each(|(ni, out)| {
                let sample = &x[ni * plan.sample_len()..][..plan.sample_len()];
                let mut col = vec![0.0f32; k * l];
                for g in 0..plan.groups {
                    plan.im2col(sample, g, &mut col);
                    let out_g = &mut out[g * ocg * l..][..ocg * l];
                    let beta = match b {
                        Some(b) => {
                            for (o, row) in out_g.chunks_mut(l).enumerate() {
                                row.fill(b[g * ocg + o]);
                            }
                            1.0
                        }
                        None => 0.0,
                    };
                    let w_g = &w[g * ocg * k..][..ocg * k];
                    sgemm_rowmajor(n(), n(), ocg, l, k, 1.0, w_g, &col, beta, out_g);
                }
            });
    }

    let out_shape = [plan.batch, plan.out_channels, plan.out_h, plan.out_w];
    let mut output = Tensor::new(result, &out_shape);

    let needs_grad =
        input.requires_grad || weight.requires_grad || bias.is_some_and(|b| b.requires_grad);
    if needs_grad {
        output.requires_grad = true;

        let x = input.clone();
        let wt = weight.clone();
        let bs = bias.cloned();
        let out = output.clone();

        let mut parents = vec![input, weight];
        parents.extend(bias);
        Tape::push_op(&parents, &output, move || {
            let Some(gout) = out.grad_ref() else {
                return;
            };

            if let Some(b) = bs.as_ref().filter(|b| b.requires_grad) {
                let mut gb = vec![0.0f32; plan.out_channels];
                for sample in gout.chunks(per_sample) {
                    for (o, row) in sample.chunks(l).enumerate() {
                        gb[o] += row.iter().sum::<f32>();
                    }
                }
                ops::accumulate_grad(b, &gb);
            }

            if !(x.requires_grad || wt.requires_grad) {
                return;
            }

            let mut gw = wt.requires_grad.then(|| vec![0.0f32; wt.numel()]);
            let mut gx = x.requires_grad.then(|| vec![0.0f32; x.numel()]);
            {
                let xd = x.data();
                let wd = wt.data();
                let mut col = vec![0.0f32; k * l];
                for ni in 0..plan.batch {
                    let sample = &xd[ni * plan.sample_len()..][..plan.sample_len()];
                    for g in 0..plan.groups {
                        let gout_g = &gout[ni * per_sample + g * ocg * l..][..ocg * l];
                        if let Some(gw) = gw.as_mut() {
                            // dW_g += dY_g · colᵀ
                            plan.im2col(sample, g, &mut col);
                            let gw_g = &mut gw[g * ocg * k..][..ocg * k];
                            sgemm_rowmajor(n(), t(), ocg, k, l, 1.0, gout_g, &col, 1.0, gw_g);
                        }
                        if let Some(gx) = gx.as_mut() {
                            // dcol = W_gᵀ · dY_g
                            let w_g = &wd[g * ocg * k..][..ocg * k];
                            sgemm_rowmajor(t(), n(), k, l, ocg, 1.0, w_g, gout_g, 0.0, &mut col);
                            let gx_n = &mut gx[ni * plan.sample_len()..][..plan.sample_len()];
                            plan.col2im(&col, g, gx_n);
                        }
                    }
                }
            }
            if let Some(gw) = gw {
                ops::accumulate_grad(&wt, &gw);
            }
            if let Some(gx) = gx {
                ops::accumulate_grad(&x, &gx);
            }
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn t4(data: Vec<f32>, shape: [usize; 4]) -> Tensor {
        Tensor::new(data, &shape)
    }

    fn row_conv(mode: PaddingMode) -> Vec<f32> {
        // [1, 2, 3] ⊛ [1, 1, 1], one column of padding on each side
        let x = t4(vec![1.0, 2.0, 3.0], [1, 1, 1, 3]);
        let w = t4(vec![1.0, 1.0, 1.0], [1, 1, 1, 3]);
        let geometry = ConvGeometry::default().with_padding((0, 1)).with_padding_mode(mode);
        conv2d(&x, &w, None, &geometry).unwrap().to_vec()
    }

    #[test]
    fn test_conv2d_basic_values() {
        let x = t4((1..=9).map(|v| v as f32).collect(), [1, 1, 3, 3]);
        let w = t4(vec![1.0, 0.0, 0.0, 1.0], [1, 1, 2, 2]);
        let b = Tensor::new(vec![0.5], &[1]);

        let y = conv2d(&x, &w, Some(&b), &ConvGeometry::default()).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // x[i][j] + x[i+1][j+1] + 0.5
        assert_eq!(y.to_vec(), vec![6.5, 8.5, 12.5, 14.5]);
    }

    #[test]
    fn test_conv2d_stride_and_zero_padding() {
        let x = t4(vec![1.0; 16], [1, 1, 4, 4]);
        let w = t4(vec![1.0; 9], [1, 1, 3, 3]);
        let geometry = ConvGeometry::default().with_stride((2, 2)).with_padding((1, 1));

        let y = conv2d(&x, &w, None, &geometry).unwrap();
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        // top-left window sees a 2x2 corner, the others a 2x3 / 3x2 / 3x3 patch
        assert_eq!(y.to_vec(), vec![4.0, 6.0, 6.0, 9.0]);
    }

    #[test]
    fn test_conv2d_dilation() {
        let x = t4((0..25).map(|v| v as f32).collect(), [1, 1, 5, 5]);
        let w = t4(vec![1.0; 4], [1, 1, 2, 2]);
        let geometry = ConvGeometry::default().with_dilation((2, 2));

        let y = conv2d(&x, &w, None, &geometry).unwrap();
        assert_eq!(y.shape(), &[1, 1, 3, 3]);
        // x[0][0] + x[0][2] + x[2][0] + x[2][2] = 0 + 2 + 10 + 12
        assert_eq!(y.data()[0], 24.0);
    }

    #[test]
    fn test_conv2d_groups_are_independent() {
        // two channels, groups=2: each output channel only sees its own input channel
        let x = t4(vec![1.0, 2.0, 10.0, 20.0], [1, 2, 1, 2]);
        let w = t4(vec![3.0, -1.0], [2, 1, 1, 1]);
        let geometry = ConvGeometry::default().with_groups(2);

        let y = conv2d(&x, &w, None, &geometry).unwrap();
        assert_eq!(y.shape(), &[1, 2, 1, 2]);
        assert_eq!(y.to_vec(), vec![3.0, 6.0, -10.0, -20.0]);
    }

    #[test]
    fn test_conv2d_batch() {
        let x = t4(vec![1.0, 2.0, 3.0, 4.0], [2, 1, 1, 2]);
        let w = t4(vec![2.0], [1, 1, 1, 1]);
        let y = conv2d(&x, &w, None, &ConvGeometry::default()).unwrap();
        assert_eq!(y.shape(), &[2, 1, 1, 2]);
        assert_eq!(y.to_vec(), vec![2.0, 4.0, 6.0, 8.0]);
    }

    #[test]
    fn test_padding_modes() {
        assert_eq!(row_conv(PaddingMode::Zeros), vec![3.0, 6.0, 5.0]);
        assert_eq!(row_conv(PaddingMode::Circular), vec![6.0, 6.0, 6.0]);
        assert_eq!(row_conv(PaddingMode::Replicate), vec![4.0, 6.0, 8.0]);
        assert_eq!(row_conv(PaddingMode::Reflect), vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_shape_mismatch_errors() {
        let x = Tensor::zeros(&[1, 3, 4, 4]);
        let w = Tensor::zeros(&[2, 2, 3, 3]);
        let err = conv2d(&x, &w, None, &ConvGeometry::default()).unwrap_err();
        assert!(matches!(err, QatError::ShapeMismatch(_)));

        let big = Tensor::zeros(&[1, 3, 5, 5]);
        let small = Tensor::zeros(&[1, 3, 2, 2]);
        let err = conv2d(&small, &big, None, &ConvGeometry::default()).unwrap_err();
        assert!(matches!(err, QatError::ShapeMismatch(_)));

        let w = Tensor::zeros(&[2, 3, 1, 1]);
        let bias = Tensor::zeros(&[3]);
        let err = conv2d(&small, &w, Some(&bias), &ConvGeometry::default()).unwrap_err();
        assert!(matches!(err, QatError::ShapeMismatch(_)));

        let flat = Tensor::zeros(&[3, 4]);
        assert!(matches!(
            conv2d(&flat, &w, None, &ConvGeometry::default()),
            Err(QatError::ShapeMismatch(_))
        ));

        let reflect = ConvGeometry::default()
            .with_padding((2, 2))
            .with_padding_mode(PaddingMode::Reflect);
        assert!(matches!(
            conv2d(&small, &w, None, &reflect),
            Err(QatError::ShapeMismatch(_))
        ));

        // circular padding may wrap the whole input once, not more
        let circular = |p| {
            ConvGeometry::default()
                .with_padding(p)
                .with_padding_mode(PaddingMode::Circular)
        };
        assert!(matches!(
            conv2d(&small, &w, None, &circular((3, 0))),
            Err(QatError::ShapeMismatch(_))
        ));
        assert!(matches!(
            conv2d(&small, &w, None, &circular((0, 3))),
            Err(QatError::ShapeMismatch(_))
        ));
        let y = conv2d(&small, &w, None, &circular((2, 2))).unwrap();
        assert_eq!(y.shape(), &[1, 2, 6, 6]);
    }

    #[test]
    fn test_zero_stride_is_invalid_config() {
        let x = Tensor::zeros(&[1, 1, 3, 3]);
        let w = Tensor::zeros(&[1, 1, 1, 1]);
        let geometry = ConvGeometry::default().with_stride((0, 1));
        assert!(matches!(
            conv2d(&x, &w, None, &geometry),
            Err(QatError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_conv2d_gradients_match_finite_differences() {
        Tape::reset();

        let geometry = ConvGeometry::default()
            .with_padding((1, 1))
            .with_stride((1, 2))
            .with_groups(2)
            .with_padding_mode(PaddingMode::Circular);
        let x_data = Tensor::randn(&[2, 2, 4, 5]).to_vec();
        let w_data = Tensor::randn(&[4, 1, 3, 3]).to_vec();
        let b_data = vec![0.1, -0.2, 0.3, 0.0];
        let probe = Tensor::randn(&[2, 4, 4, 3]);

        let objective = |xv: &[f32], wv: &[f32]| -> f32 {
            let x = Tensor::new(xv.to_vec(), &[2, 2, 4, 5]);
            let w = Tensor::new(wv.to_vec(), &[4, 1, 3, 3]);
            let b = Tensor::new(b_data.clone(), &[4]);
            let y = conv2d(&x, &w, Some(&b), &geometry).unwrap().to_vec();
            let p = probe.to_vec();
            y.iter().zip(&p).map(|(a, b)| a * b).sum()
        };

        let x = Tensor::new(x_data.clone(), &[2, 2, 4, 5]).requires_grad();
        let w = Tensor::new(w_data.clone(), &[4, 1, 3, 3]).requires_grad();
        let b = Tensor::new(b_data.clone(), &[4]).requires_grad();
        let y = conv2d(&x, &w, Some(&b), &geometry).unwrap();
        assert_eq!(y.shape(), &[2, 4, 4, 3]);
        (&y * &probe).backward();

        let eps = 1e-2;
        let gx = x.grad().unwrap().to_vec();
        for i in (0..x_data.len()).step_by(7) {
            let mut plus = x_data.clone();
            let mut minus = x_data.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (objective(&plus, &w_data) - objective(&minus, &w_data)) / (2.0 * eps);
            assert_abs_diff_eq!(gx[i], numeric, epsilon = 1e-2);
        }

        let gw = w.grad().unwrap().to_vec();
        for i in 0..w_data.len() {
            let mut plus = w_data.clone();
            let mut minus = w_data.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let numeric = (objective(&x_data, &plus) - objective(&x_data, &minus)) / (2.0 * eps);
            assert_abs_diff_eq!(gw[i], numeric, epsilon = 1e-2);
        }

        // dL/db[o] = sum of the probe over channel o
        let gb = b.grad().unwrap().to_vec();
        let pd = probe.data();
        for (o, &g) in gb.iter().enumerate() {
            let expected: f32 = (0..2)
                .map(|ni| pd[ni * 48 + o * 12..][..12].iter().sum::<f32>())
                .sum();
            assert_abs_diff_eq!(g, expected, epsilon = 1e-4);
        }
    }
}
