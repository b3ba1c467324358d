//! QAT-aware convolution layers
//!
//! Both layers own their learnable weight, optional bias, convolution
//! options and two fake-quant modules:
//!
//! - [`QATConv2d`]: `activation_fq(conv(x, weight_fq(w)))`
//! - [`ConvReLU2d`]: `activation_fq(rectify(conv(x, weight_fq(w))))`, the
//!   fused unit. Its activation fake-quant only ever sees rectified values.
//!
//! The weight fake-quant is applied to the live learnable weight on every
//! call, so the straight-through gradient lands on the real parameter.

use super::fake_quantize::FakeQuantize;
use super::qat_config::QConfig;
use super::qat_manager::FakeQuantControl;
use crate::activation::Rectifier;
use crate::conv;
use crate::error::Result;
use crate::nn::{Conv2d, Conv2dOptions, Module};
use crate::Tensor;

/// Convolution with fake-quantized weights; shared by both QAT layers.
#[derive(Debug)]
struct QuantizedConv {
    weight: Tensor,
    bias: Option<Tensor>,
    options: Conv2dOptions,
    weight_fake_quant: FakeQuantize,
    activation_fake_quant: FakeQuantize,
}

impl QuantizedConv {
    fn new(options: Conv2dOptions, qconfig: &QConfig) -> Result<Self> {
        let (weight, bias) = options.init_parameters()?;
        Self::from_parts(weight, bias, options, qconfig)
    }

    fn from_parts(
        weight: Tensor,
        bias: Option<Tensor>,
        options: Conv2dOptions,
        qconfig: &QConfig,
    ) -> Result<Self> {
        options.validate()?;
        options.check_weight(&weight)?;
        if let Some(b) = &bias {
            options.check_bias(b)?;
        }
        let (activation_fake_quant, weight_fake_quant) = qconfig.build()?;
        Ok(Self {
            weight,
            bias,
            options,
            weight_fake_quant,
            activation_fake_quant,
        })
    }

    /// Steps 1–2: fake-quantize the live weight, then convolve.
    fn convolve(&mut self, input: &Tensor) -> Result<Tensor> {
        let weight = self.weight_fake_quant.apply(&self.weight)?;
        conv::conv2d(input, &weight, self.bias.as_ref(), &self.options.geometry())
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }

    fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        self.options.check_weight(&weight)?;
        self.weight = weight;
        Ok(())
    }

    fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        self.options.check_bias(&bias)?;
        self.bias = Some(bias);
        Ok(())
    }

    fn set_observing(&mut self, enabled: bool) {
        self.weight_fake_quant.set_observing(enabled);
        self.activation_fake_quant.set_observing(enabled);
    }

    fn set_fake_quant_enabled(&mut self, enabled: bool) {
        self.weight_fake_quant.set_fake_quant_enabled(enabled);
        self.activation_fake_quant.set_fake_quant_enabled(enabled);
    }
}

/// Conv2d with fake-quantized weight and output (no rectifier).
#[derive(Debug)]
pub struct QATConv2d {
    inner: QuantizedConv,
}

impl QATConv2d {
    pub fn new(options: Conv2dOptions, qconfig: &QConfig) -> Result<Self> {
        Ok(Self {
            inner: QuantizedConv::new(options, qconfig)?,
        })
    }

    /// Wrap a float `Conv2d`, sharing its weight and bias storage.
    pub fn from_float(float: &Conv2d, qconfig: &QConfig) -> Result<Self> {
        Ok(Self {
            inner: QuantizedConv::from_parts(
                float.weight.clone(),
                float.bias.clone(),
                float.options.clone(),
                qconfig,
            )?,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.inner.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias.as_ref()
    }

    pub fn options(&self) -> &Conv2dOptions {
        &self.inner.options
    }

    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        self.inner.set_weight(weight)
    }

    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        self.inner.set_bias(bias)
    }

    pub fn weight_fake_quant(&self) -> &FakeQuantize {
        &self.inner.weight_fake_quant
    }

    pub fn weight_fake_quant_mut(&mut self) -> &mut FakeQuantize {
        &mut self.inner.weight_fake_quant
    }

    pub fn activation_fake_quant(&self) -> &FakeQuantize {
        &self.inner.activation_fake_quant
    }

    pub fn activation_fake_quant_mut(&mut self) -> &mut FakeQuantize {
        &mut self.inner.activation_fake_quant
    }
}

impl Module for QATConv2d {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let y = self.inner.convolve(input)?;
        self.inner.activation_fake_quant.apply(&y)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.inner.parameters()
    }
}

impl FakeQuantControl for QATConv2d {
    fn set_observing(&mut self, enabled: bool) {
        self.inner.set_observing(enabled);
    }

    fn set_fake_quant_enabled(&mut self, enabled: bool) {
        self.inner.set_fake_quant_enabled(enabled);
    }
}

/// Fused Conv2d + ReLU for quantization-aware training.
///
/// Drop-in replacement for a `Conv2d` followed by `ReLU`: same
/// hyperparameters, plus the two fake-quant configurations. The output is
/// observed and quantized once, after the rectifier.
#[derive(Debug)]
pub struct ConvReLU2d {
    inner: QuantizedConv,
    rectifier: Rectifier,
}

impl ConvReLU2d {
    /// Fails with `InvalidConfig` on bad hyperparameters (e.g. `in_channels`
    /// not divisible by `groups`) or an invalid fake-quant configuration.
    pub fn new(options: Conv2dOptions, qconfig: &QConfig) -> Result<Self> {
        Ok(Self {
            inner: QuantizedConv::new(options, qconfig)?,
            rectifier: Rectifier::ReLU,
        })
    }

    /// Wrap a float `Conv2d`, sharing its weight and bias storage.
    pub fn from_float(float: &Conv2d, qconfig: &QConfig) -> Result<Self> {
        Ok(Self {
            inner: QuantizedConv::from_parts(
                float.weight.clone(),
                float.bias.clone(),
                float.options.clone(),
                qconfig,
            )?,
            rectifier: Rectifier::ReLU,
        })
    }

    /// Select the rectifier (`ReLU6` for the Conv + ReLU6 fusion).
    pub fn with_rectifier(mut self, rectifier: Rectifier) -> Self {
        self.rectifier = rectifier;
        self
    }

    pub fn rectifier(&self) -> Rectifier {
        self.rectifier
    }

    pub fn weight(&self) -> &Tensor {
        &self.inner.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias.as_ref()
    }

    pub fn options(&self) -> &Conv2dOptions {
        &self.inner.options
    }

    /// Replace the learnable weight; the shape must match the options.
    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        self.inner.set_weight(weight)
    }

    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        self.inner.set_bias(bias)
    }

    pub fn weight_fake_quant(&self) -> &FakeQuantize {
        &self.inner.weight_fake_quant
    }

    pub fn weight_fake_quant_mut(&mut self) -> &mut FakeQuantize {
        &mut self.inner.weight_fake_quant
    }

    pub fn activation_fake_quant(&self) -> &FakeQuantize {
        &self.inner.activation_fake_quant
    }

    pub fn activation_fake_quant_mut(&mut self) -> &mut FakeQuantize {
        &mut self.inner.activation_fake_quant
    }
}

impl Module for ConvReLU2d {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        let y = self.inner.convolve(input)?;
        let rectified = self.rectifier.apply(&y);
        let output = self.inner.activation_fake_quant.apply(&rectified)?;

        tracing::trace!(
            input = ?input.shape(),
            output = ?output.shape(),
            rectifier = ?self.rectifier,
            "conv-relu forward"
        );
        Ok(output)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.inner.parameters()
    }
}

impl FakeQuantControl for ConvReLU2d {
    fn set_observing(&mut self, enabled: bool) {
        self.inner.set_observing(enabled);
    }

    fn set_fake_quant_enabled(&mut self, enabled: bool) {
        self.inner.set_fake_quant_enabled(enabled);
    }
}
