use crate::error::Result;
use crate::{nn::Module, Tensor};

/// Rectifier applied between a convolution and its output fake quantization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rectifier {
    /// `max(x, 0)`
    #[default]
    ReLU,
    /// `min(max(x, 0), 6)`
    ReLU6,
}

impl Rectifier {
    pub fn apply(&self, input: &Tensor) -> Tensor {
        match self {
            Rectifier::ReLU => input.relu(),
            Rectifier::ReLU6 => input.relu6(),
        }
    }
}

/// ReLU activation as a module
pub struct ReLU;

impl Module for ReLU {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        Ok(input.relu())
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}

/// ReLU6 activation as a module
pub struct ReLU6;

impl Module for ReLU6 {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        Ok(input.relu6())
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![]
    }
}
