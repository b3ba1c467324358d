//! Fused Conv2d + ReLU for quantization-aware training.
//!
//! [`ConvReLU2d`] convolves its input with a fake-quantized copy of its
//! learnable weight, rectifies, and fake-quantizes the rectified output.
//! Gradients flow through both fake-quant steps with the straight-through
//! estimator, recorded on the thread-local [`Tape`].
//!
//! Tensors share storage through `Rc`, so layers and their fake-quant
//! statistics stay on the thread that created them; the convolution itself
//! parallelizes internally over the batch.

pub mod activation;
pub mod conv;
pub mod error;
pub mod gemm;
pub mod nn;
pub mod ops;
pub mod quantization;
pub mod tape;
pub mod tensor;

pub use activation::{Rectifier, ReLU, ReLU6};
pub use conv::{conv2d, ConvGeometry, PaddingMode};
pub use error::{QatError, Result};
pub use gemm::{n, sgemm_rowmajor, t};
pub use nn::{Conv2d, Conv2dOptions, Module, Sequential};
pub use quantization::{ConvReLU2d, FakeQuantConfig, FakeQuantize, QATConv2d, QConfig};
pub use tape::Tape;
pub use tensor::Tensor;
