//! Quantization-Aware Training (QAT) configuration
//!
//! A [`QConfig`] pairs the activation-side and weight-side fake-quant
//! configurations a QAT layer is built from. Defaults are constructed on
//! every call, so no two layers ever share configuration state.

use super::config::{FakeQuantConfig, QuantScheme};
use super::fake_quantize::FakeQuantize;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct QConfig {
    /// Fake quantization of the layer output.
    pub activation: FakeQuantConfig,
    /// Fake quantization of the learnable weight.
    pub weight: FakeQuantConfig,
}

impl Default for QConfig {
    /// Activation: uint8 affine per tensor. Weight: int8 symmetric per tensor.
    fn default() -> Self {
        Self {
            activation: FakeQuantConfig::activation(),
            weight: FakeQuantConfig::weight(),
        }
    }
}

impl QConfig {
    pub fn new(activation: FakeQuantConfig, weight: FakeQuantConfig) -> Self {
        Self { activation, weight }
    }

    /// Default activation, per-output-channel symmetric weight.
    pub fn per_channel() -> Self {
        Self {
            weight: FakeQuantConfig::per_channel_weight(),
            ..Self::default()
        }
    }

    /// 4-bit weights, 8-bit activations.
    pub fn int4_weight() -> Self {
        Self {
            weight: FakeQuantConfig::int4(true),
            ..Self::default()
        }
    }

    /// Both sides start as pass-through (float behaviour).
    pub fn disabled() -> Self {
        Self {
            activation: FakeQuantConfig::activation().disabled(),
            weight: FakeQuantConfig::weight().disabled(),
        }
    }

    pub fn with_activation(mut self, activation: FakeQuantConfig) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_weight(mut self, weight: FakeQuantConfig) -> Self {
        self.weight = weight;
        self
    }

    /// Switch the weight side between symmetric and affine mapping.
    pub fn with_symmetric_weight(mut self, symmetric: bool) -> Self {
        self.weight.scheme = if symmetric {
            QuantScheme::Symmetric
        } else {
            QuantScheme::Affine
        };
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.activation.validate()?;
        self.weight.validate()
    }

    /// Instantiate `(activation_fake_quant, weight_fake_quant)`.
    pub fn build(&self) -> Result<(FakeQuantize, FakeQuantize)> {
        Ok((self.activation.build()?, self.weight.build()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::config::Granularity;

    #[test]
    fn test_default_qconfig() {
        let qconfig = QConfig::default();
        assert_eq!((qconfig.activation.qmin, qconfig.activation.qmax), (0, 255));
        assert_eq!((qconfig.weight.qmin, qconfig.weight.qmax), (-128, 127));
        assert!(qconfig.validate().is_ok());
    }

    #[test]
    fn test_qconfig_builder() {
        let qconfig = QConfig::per_channel().with_symmetric_weight(false);
        assert_eq!(qconfig.weight.granularity, Granularity::PerChannel { axis: 0 });
        assert_eq!(qconfig.weight.scheme, QuantScheme::Affine);

        let (act, weight) = QConfig::disabled().build().unwrap();
        assert!(!act.is_observing() && !act.is_fake_quant_enabled());
        assert!(!weight.is_observing() && !weight.is_fake_quant_enabled());
    }

    #[test]
    fn test_defaults_are_independent() {
        let mut a = QConfig::default();
        a.activation.qmax = 15;
        assert_eq!(QConfig::default().activation.qmax, 255);
    }

    #[test]
    fn test_invalid_side_fails_build() {
        let qconfig = QConfig::default().with_weight(FakeQuantConfig::weight().with_range(1, 0));
        assert!(qconfig.build().is_err());
    }
}
