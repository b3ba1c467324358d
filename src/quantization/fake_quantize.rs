//! Fake quantization module for Quantization-Aware Training
//!
//! Wraps the affine fake-quant op with running statistics and two independent
//! switches:
//!
//! | observing | fake_quant | behaviour                                  |
//! |-----------|------------|--------------------------------------------|
//! | off       | off        | pass-through                               |
//! | on        | off        | calibration: collect statistics only       |
//! | off       | on         | frozen statistics, simulate quantization   |
//! | on        | on         | standard QAT                               |
//!
//! Not safe for concurrent use of one instance; tensors are `!Send`, so the
//! compiler keeps an instance on the thread that owns it.

use super::affine::{self, QuantizationParams};
use super::config::{CalibrationMode, FakeQuantConfig, Granularity};
use super::observers::MinMaxObserver;
use crate::error::{QatError, Result};
use crate::Tensor;

#[derive(Debug, Clone)]
pub struct FakeQuantize {
    config: FakeQuantConfig,
    observer: MinMaxObserver,
    /// Calibrated params; empty until the first calibration.
    params: Vec<QuantizationParams>,
    observing: bool,
    fake_quant_enabled: bool,
}

impl FakeQuantize {
    pub fn new(config: FakeQuantConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            observer: MinMaxObserver::new(config.granularity),
            params: Vec::new(),
            observing: config.observer_enabled,
            fake_quant_enabled: config.fake_quant_enabled,
            config,
        })
    }

    /// Observe (if enabled), then fake-quantize (if enabled) `input`.
    ///
    /// With fake quantization disabled the input handle is returned as is,
    /// sharing storage and gradient with `input`.
    pub fn apply(&mut self, input: &Tensor) -> Result<Tensor> {
        if self.observing {
            self.observer.observe(input)?;
            if self.config.calibration == CalibrationMode::Continuous
                && self.observer.is_initialized()
            {
                self.calibrate()?;
            }
        }

        if !self.fake_quant_enabled {
            return Ok(input.clone());
        }

        match self.config.granularity {
            Granularity::PerTensor => {
                let params = match (self.params.first(), &self.config.initial_params) {
                    (Some(p), _) | (None, Some(p)) => *p,
                    (None, None) => return Err(QatError::UninitializedQuantizer),
                };
                affine::fake_quantize_per_tensor(input, &params)
            }
            Granularity::PerChannel { axis } => {
                if !self.params.is_empty() {
                    return affine::fake_quantize_per_channel(input, &self.params, axis);
                }
                let Some(initial) = self.config.initial_params else {
                    return Err(QatError::UninitializedQuantizer);
                };
                let channels = input.shape().get(axis).copied().unwrap_or(0);
                affine::fake_quantize_per_channel(input, &vec![initial; channels], axis)
            }
        }
    }

    /// Recompute `(scale, zero_point)` from the running statistics.
    pub fn calibrate(&mut self) -> Result<()> {
        if !self.observer.is_initialized() {
            return Err(QatError::UninitializedQuantizer);
        }
        self.params =
            self.observer
                .calculate_qparams(self.config.qmin, self.config.qmax, self.config.scheme)?;

        if let [p] = self.params.as_slice() {
            tracing::debug!(
                scale = p.scale,
                zero_point = p.zero_point,
                min = self.observer.global_min(),
                max = self.observer.global_max(),
                "fake-quant params updated"
            );
        } else {
            tracing::debug!(channels = self.params.len(), "per-channel fake-quant params updated");
        }
        Ok(())
    }

    pub fn set_observing(&mut self, enabled: bool) {
        self.observing = enabled;
    }

    pub fn set_fake_quant_enabled(&mut self, enabled: bool) {
        self.fake_quant_enabled = enabled;
    }

    pub fn is_observing(&self) -> bool {
        self.observing
    }

    pub fn is_fake_quant_enabled(&self) -> bool {
        self.fake_quant_enabled
    }

    /// Forget all statistics and calibrated params.
    pub fn reset_statistics(&mut self) {
        self.observer.reset();
        self.params.clear();
    }

    /// Running minimum over all channels; `+∞` before any observation.
    pub fn running_min(&self) -> f32 {
        self.observer.global_min()
    }

    /// Running maximum over all channels; `−∞` before any observation.
    pub fn running_max(&self) -> f32 {
        self.observer.global_max()
    }

    pub fn observer(&self) -> &MinMaxObserver {
        &self.observer
    }

    /// Calibrated params: one entry per tensor or per channel, empty before calibration.
    pub fn params(&self) -> &[QuantizationParams] {
        &self.params
    }

    /// Per-tensor scale, falling back to the configured initial params.
    pub fn scale(&self) -> Option<f32> {
        self.current().map(|p| p.scale)
    }

    pub fn zero_point(&self) -> Option<i32> {
        self.current().map(|p| p.zero_point)
    }

    fn current(&self) -> Option<QuantizationParams> {
        self.params.first().copied().or(self.config.initial_params)
    }

    pub fn config(&self) -> &FakeQuantConfig {
        &self.config
    }
}
