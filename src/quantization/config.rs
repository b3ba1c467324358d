//! Fake quantization configuration.
//!
//! A [`FakeQuantConfig`] describes one fake-quant module: integer range,
//! mapping scheme, granularity, calibration mode and the initial state of
//! its two lifecycle flags.

use super::affine::QuantizationParams;
use super::fake_quantize::FakeQuantize;
use crate::error::{QatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationType {
    Int8,
    UInt8,
    Int4,
    UInt4,
}

impl QuantizationType {
    /// Integer range `(qmin, qmax)` of the type.
    pub fn range(&self) -> (i32, i32) {
        match self {
            QuantizationType::Int8 => (-128, 127),
            QuantizationType::UInt8 => (0, 255),
            QuantizationType::Int4 => (-8, 7),
            QuantizationType::UInt4 => (0, 15),
        }
    }

    pub fn bit_width(&self) -> u8 {
        match self {
            QuantizationType::Int8 | QuantizationType::UInt8 => 8,
            QuantizationType::Int4 | QuantizationType::UInt4 => 4,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, QuantizationType::Int8 | QuantizationType::Int4)
    }
}

/// How observed ranges map to `(scale, zero_point)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantScheme {
    /// Range centred on zero; zero_point fixed at the middle of `[qmin, qmax]`.
    Symmetric,
    /// `[min, max]` mapped onto `[qmin, qmax]`.
    Affine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    PerTensor,
    /// One set of params per slice along `axis` (axis 0 = output channel of a conv weight).
    PerChannel { axis: usize },
}

/// When params are recomputed from the running statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationMode {
    /// After every observing `apply`.
    Continuous,
    /// Only on an explicit `calibrate()`.
    OnRequest,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FakeQuantConfig {
    pub quant_type: QuantizationType,
    pub qmin: i32,
    pub qmax: i32,
    pub scheme: QuantScheme,
    pub granularity: Granularity,
    pub calibration: CalibrationMode,
    /// Initial value of the observing flag.
    pub observer_enabled: bool,
    /// Initial value of the fake-quant flag.
    pub fake_quant_enabled: bool,
    /// Params used while nothing has been observed. Without them an
    /// unobserved module refuses to quantize.
    pub initial_params: Option<QuantizationParams>,
}

impl Default for FakeQuantConfig {
    fn default() -> Self {
        Self::activation()
    }
}

impl FakeQuantConfig {
    pub fn new(quant_type: QuantizationType, scheme: QuantScheme) -> Self {
        let (qmin, qmax) = quant_type.range();
        Self {
            quant_type,
            qmin,
            qmax,
            scheme,
            granularity: Granularity::PerTensor,
            calibration: CalibrationMode::Continuous,
            observer_enabled: true,
            fake_quant_enabled: true,
            initial_params: None,
        }
    }

    /// Default activation fake-quant: unsigned 8-bit, affine, per tensor.
    pub fn activation() -> Self {
        Self::new(QuantizationType::UInt8, QuantScheme::Affine)
    }

    /// Default weight fake-quant: signed 8-bit, symmetric, per tensor.
    pub fn weight() -> Self {
        Self::new(QuantizationType::Int8, QuantScheme::Symmetric)
    }

    /// Signed 8-bit symmetric, one set of params per output channel.
    pub fn per_channel_weight() -> Self {
        Self::weight().with_granularity(Granularity::PerChannel { axis: 0 })
    }

    pub fn int4(symmetric: bool) -> Self {
        if symmetric {
            Self::new(QuantizationType::Int4, QuantScheme::Symmetric)
        } else {
            Self::new(QuantizationType::UInt4, QuantScheme::Affine)
        }
    }

    /// Custom integer range.
    pub fn with_range(mut self, qmin: i32, qmax: i32) -> Self {
        self.qmin = qmin;
        self.qmax = qmax;
        self
    }

    /// Drop one bit of range (keeps headroom for accumulators on some backends).
    pub fn with_reduce_range(mut self) -> Self {
        let (qmin, qmax) = self.quant_type.range();
        if self.quant_type.is_signed() {
            self.qmin = qmin / 2;
            self.qmax = qmax / 2;
        } else {
            self.qmin = qmin;
            self.qmax = qmax / 2;
        }
        self
    }

    pub fn with_scheme(mut self, scheme: QuantScheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_calibration(mut self, calibration: CalibrationMode) -> Self {
        self.calibration = calibration;
        self
    }

    pub fn with_observer(mut self, enabled: bool) -> Self {
        self.observer_enabled = enabled;
        self
    }

    pub fn with_fake_quant(mut self, enabled: bool) -> Self {
        self.fake_quant_enabled = enabled;
        self
    }

    pub fn with_initial_params(mut self, params: QuantizationParams) -> Self {
        self.initial_params = Some(params);
        self
    }

    /// Both flags off: the module is a pure pass-through.
    pub fn disabled(self) -> Self {
        self.with_observer(false).with_fake_quant(false)
    }

    pub fn is_per_channel(&self) -> bool {
        matches!(self.granularity, Granularity::PerChannel { .. })
    }

    pub fn validate(&self) -> Result<()> {
        if self.qmin >= self.qmax {
            return Err(QatError::InvalidConfig(format!(
                "qmin ({}) must be smaller than qmax ({})",
                self.qmin, self.qmax
            )));
        }
        if let Some(params) = &self.initial_params {
            params.validate()?;
            if (params.qmin, params.qmax) != (self.qmin, self.qmax) {
                return Err(QatError::InvalidConfig(format!(
                    "initial params range [{}, {}] differs from configured [{}, {}]",
                    params.qmin, params.qmax, self.qmin, self.qmax
                )));
            }
        }
        Ok(())
    }

    /// Instantiate a fake-quant module from this configuration.
    pub fn build(&self) -> Result<FakeQuantize> {
        FakeQuantize::new(self.clone())
    }
}
