//! Fake quantization and quantization-aware training.
//!
//! Bottom-up: [`affine`] holds the stateless fake-quant op and its
//! straight-through gradient, [`observers`] the running min/max statistics,
//! [`fake_quantize`] the stateful module combining both. The QAT layers in
//! [`qat_layers`] own two such modules each, built from a [`QConfig`].

pub mod affine;
pub mod config;
pub mod fake_quantize;
pub mod observers;
pub mod qat_config;
pub mod qat_layers;
pub mod qat_manager;

pub use affine::{fake_quantize_per_channel, fake_quantize_per_tensor, QuantizationParams};
pub use config::{CalibrationMode, FakeQuantConfig, Granularity, QuantScheme, QuantizationType};
pub use fake_quantize::FakeQuantize;
pub use observers::{calculate_qparams, MinMaxObserver};
pub use qat_config::QConfig;
pub use qat_layers::{ConvReLU2d, QATConv2d};
pub use qat_manager::{FakeQuantControl, QATManager, QatPhase};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_type_ranges() {
        assert_eq!(QuantizationType::Int8.range(), (-128, 127));
        assert_eq!(QuantizationType::UInt8.range(), (0, 255));
        assert_eq!(QuantizationType::Int4.range(), (-8, 7));
        assert_eq!(QuantizationType::UInt4.range(), (0, 15));
    }

    #[test]
    fn test_qconfig_builds_fresh_modules() {
        let qconfig = QConfig::default();
        let (mut a, _) = qconfig.build().unwrap();
        a.apply(&crate::Tensor::new(vec![1.0, 2.0], &[2])).unwrap();

        let (b, _) = qconfig.build().unwrap();
        assert!(a.observer().is_initialized());
        assert!(!b.observer().is_initialized());
    }
}
