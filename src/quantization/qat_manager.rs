//! QAT lifecycle management
//!
//! Every fake-quant module has two switches (observe, fake-quantize). A
//! [`QatPhase`] names one of their four combinations, and the
//! [`QATManager`] maps training epochs to phases: float warmup, then
//! observation-only calibration, then full QAT, and finally frozen
//! statistics once the observer freeze epoch is reached.

use super::fake_quantize::FakeQuantize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QatPhase {
    /// Nothing observed, nothing quantized.
    Float,
    /// Statistics collected, values untouched.
    Calibration,
    /// Statistics collected and quantization simulated.
    QuantAware,
    /// Statistics frozen, quantization simulated.
    Frozen,
}

impl QatPhase {
    pub fn observer_enabled(&self) -> bool {
        matches!(self, QatPhase::Calibration | QatPhase::QuantAware)
    }

    pub fn fake_quant_enabled(&self) -> bool {
        matches!(self, QatPhase::QuantAware | QatPhase::Frozen)
    }
}

/// Anything owning fake-quant modules whose flags can be switched together.
pub trait FakeQuantControl {
    fn set_observing(&mut self, enabled: bool);
    fn set_fake_quant_enabled(&mut self, enabled: bool);

    fn apply_phase(&mut self, phase: QatPhase) {
        self.set_observing(phase.observer_enabled());
        self.set_fake_quant_enabled(phase.fake_quant_enabled());
    }
}

impl FakeQuantControl for FakeQuantize {
    fn set_observing(&mut self, enabled: bool) {
        FakeQuantize::set_observing(self, enabled);
    }

    fn set_fake_quant_enabled(&mut self, enabled: bool) {
        FakeQuantize::set_fake_quant_enabled(self, enabled);
    }
}

/// Epoch → phase schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct QATManager {
    /// Epochs trained in float before any observation.
    pub warmup_epochs: usize,
    /// Observation-only epochs after warmup.
    pub calibration_epochs: usize,
    /// Epoch from which statistics are frozen.
    pub freeze_observer_epoch: Option<usize>,
    current: Option<QatPhase>,
}

impl Default for QATManager {
    fn default() -> Self {
        Self::new(0, 0)
    }
}

impl QATManager {
    pub fn new(warmup_epochs: usize, calibration_epochs: usize) -> Self {
        Self {
            warmup_epochs,
            calibration_epochs,
            freeze_observer_epoch: None,
            current: None,
        }
    }

    pub fn with_observer_freeze(mut self, epoch: usize) -> Self {
        self.freeze_observer_epoch = Some(epoch);
        self
    }

    pub fn phase_for_epoch(&self, epoch: usize) -> QatPhase {
        if epoch < self.warmup_epochs {
            QatPhase::Float
        } else if epoch < self.warmup_epochs + self.calibration_epochs {
            QatPhase::Calibration
        } else if self.freeze_observer_epoch.is_some_and(|freeze| epoch >= freeze) {
            QatPhase::Frozen
        } else {
            QatPhase::QuantAware
        }
    }

    /// Last phase applied by [`QATManager::step`].
    pub fn current_phase(&self) -> Option<QatPhase> {
        self.current
    }

    /// Switch every module to the phase of `epoch`.
    pub fn step(&mut self, epoch: usize, modules: &mut [&mut dyn FakeQuantControl]) -> QatPhase {
        let phase = self.phase_for_epoch(epoch);
        if self.current != Some(phase) {
            tracing::info!(epoch, ?phase, modules = modules.len(), "QAT phase transition");
            self.current = Some(phase);
        }
        for module in modules.iter_mut() {
            module.apply_phase(phase);
        }
        phase
    }
}
