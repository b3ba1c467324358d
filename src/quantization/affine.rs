//! Affine fake quantization: quantize → clamp → dequantize in f32.
//!
//! Forward: `q = round(x / scale) + zero_point`,
//! `x' = (clamp(q, qmin, qmax) - zero_point) * scale`.
//! Backward (straight-through estimator): `dx'/dx = 1` where `qmin <= q <= qmax`,
//! `0` where the value was clamped. The rounding step itself is treated as identity.
//!
//! Rounding is half-to-even, which is what integer inference kernels use.

use crate::error::{QatError, Result};
use crate::{ops, tape::Tape, Tensor};

/// `{scale, zero_point, qmin, qmax}` for one tensor or one channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantizationParams {
    pub scale: f32,
    pub zero_point: i32,
    pub qmin: i32,
    pub qmax: i32,
}

impl QuantizationParams {
    /// Validated constructor.
    pub fn new(scale: f32, zero_point: i32, qmin: i32, qmax: i32) -> Result<Self> {
        let params = Self {
            scale,
            zero_point,
            qmin,
            qmax,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.qmin >= self.qmax {
            return Err(QatError::InvalidConfig(format!(
                "qmin ({}) must be smaller than qmax ({})",
                self.qmin, self.qmax
            )));
        }
        if !(self.scale.is_finite() && self.scale > 0.0) {
            return Err(QatError::InvalidConfig(format!(
                "scale must be positive and finite, got {}",
                self.scale
            )));
        }
        if !(self.qmin..=self.qmax).contains(&self.zero_point) {
            return Err(QatError::InvalidConfig(format!(
                "zero_point {} outside [{}, {}]",
                self.zero_point, self.qmin, self.qmax
            )));
        }
        Ok(())
    }

    /// Smallest and largest representable real values.
    pub fn real_range(&self) -> (f32, f32) {
        (
            (i64::from(self.qmin) - i64::from(self.zero_point)) as f32 * self.scale,
            (i64::from(self.qmax) - i64::from(self.zero_point)) as f32 * self.scale,
        )
    }

    /// Fake-quantize one value; the flag tells whether it fell inside the integer range.
    #[inline]
    pub fn fake_quantize_value(&self, x: f32) -> (f32, bool) {
        let q = (x / self.scale).round_ties_even() + self.zero_point as f32;
        let in_range = q >= self.qmin as f32 && q <= self.qmax as f32;
        let q = q.clamp(self.qmin as f32, self.qmax as f32);
        ((q - self.zero_point as f32) * self.scale, in_range)
    }
}

/// Fake quantization with one set of params for the whole tensor.
pub fn fake_quantize_per_tensor(input: &Tensor, params: &QuantizationParams) -> Result<Tensor> {
    params.validate()?;
    Ok(fake_quantize_with(input, move |_| params))
}

/// Fake quantization with one set of params per slice along `axis`.
pub fn fake_quantize_per_channel(
    input: &Tensor,
    params: &[QuantizationParams],
    axis: usize,
) -> Result<Tensor> {
    let shape = input.shape();
    let Some(&channels) = shape.get(axis) else {
        return Err(QatError::ShapeMismatch(format!(
            "channel axis {axis} out of range for shape {shape:?}"
        )));
    };
    if params.len() != channels {
        return Err(QatError::ShapeMismatch(format!(
            "{} channel params for {channels} channels along axis {axis}",
            params.len()
        )));
    }
    for p in params {
        p.validate()?;
    }

    let inner: usize = shape[axis + 1..].iter().product();
    Ok(fake_quantize_with(input, move |i| &params[(i / inner) % channels]))
}

fn fake_quantize_with<'p, F>(input: &Tensor, params_at: F) -> Tensor
where
    F: Fn(usize) -> &'p QuantizationParams,
{
    let (values, mask): (Vec<f32>, Vec<bool>) = input
        .data()
        .iter()
        .enumerate()
        .map(|(i, &x)| params_at(i).fake_quantize_value(x))
        .unzip();

    let mut output = Tensor::new(values, input.shape());

    if input.requires_grad {
        output.requires_grad = true;
        let inp = input.clone();
        let out = output.clone();

        Tape::push_unary_op(input, &output, move || {
            if let Some(gout) = out.grad_ref() {
                let gin: Vec<f32> = gout
                    .iter()
                    .zip(&mask)
                    .map(|(&g, &pass)| if pass { g } else { 0.0 })
                    .collect();
                ops::accumulate_grad(&inp, &gin);
            }
        });
    }

    output
}
