use crate::conv::{self, ConvGeometry, PaddingMode};
use crate::error::{QatError, Result};
use crate::Tensor;

/// Trait for any differentiable network component.
///
/// `forward` takes `&mut self` because fake-quant layers update their
/// running statistics on every call.
pub trait Module {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor>;
    fn parameters(&self) -> Vec<Tensor>;
}

/// Hyperparameters of a 2D convolution layer.
#[derive(Debug, Clone, PartialEq)]
pub struct Conv2dOptions {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
    pub bias: bool,
    pub padding_mode: PaddingMode,
}

impl Conv2dOptions {
    /// Stride 1, no padding, no dilation, one group, with bias, zero padding mode.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
            padding_mode: PaddingMode::Zeros,
        }
    }

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

    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_padding_mode(mut self, padding_mode: PaddingMode) -> Self {
        self.padding_mode = padding_mode;
        self
    }

    pub fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            groups: self.groups,
            padding_mode: self.padding_mode,
        }
    }

    /// `[out_channels, in_channels / groups, kH, kW]`
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size.0,
            self.kernel_size.1,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        self.geometry().validate()?;
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(QatError::InvalidConfig(format!(
                "channel counts must be positive, got in={} out={}",
                self.in_channels, self.out_channels
            )));
        }
        if self.kernel_size.0 == 0 || self.kernel_size.1 == 0 {
            return Err(QatError::InvalidConfig(format!(
                "kernel_size must be positive, got {:?}",
                self.kernel_size
            )));
        }
        if self.in_channels % self.groups != 0 {
            return Err(QatError::InvalidConfig(format!(
                "in_channels ({}) must be divisible by groups ({})",
                self.in_channels, self.groups
            )));
        }
        if self.out_channels % self.groups != 0 {
            return Err(QatError::InvalidConfig(format!(
                "out_channels ({}) must be divisible by groups ({})",
                self.out_channels, self.groups
            )));
        }
        Ok(())
    }

    /// Fresh learnable weight and bias, Kaiming-uniform initialized.
    pub fn init_parameters(&self) -> Result<(Tensor, Option<Tensor>)> {
        self.validate()?;
        let shape = self.weight_shape();
        let fan_in = shape[1] * shape[2] * shape[3];
        let bound = 1.0 / (fan_in as f32).sqrt();

        let weight = Tensor::uniform(&shape, bound).requires_grad();
        let bias = self
            .bias
            .then(|| Tensor::uniform(&[self.out_channels], bound).requires_grad());
        Ok((weight, bias))
    }

    /// Shape check for a replacement weight.
    pub(crate) fn check_weight(&self, weight: &Tensor) -> Result<()> {
        if weight.shape() != self.weight_shape() {
            return Err(QatError::ShapeMismatch(format!(
                "weight shape {:?}, expected {:?}",
                weight.shape(),
                self.weight_shape()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_bias(&self, bias: &Tensor) -> Result<()> {
        if !self.bias || bias.shape() != [self.out_channels] {
            return Err(QatError::ShapeMismatch(format!(
                "bias shape {:?}, expected [{}] (bias enabled: {})",
                bias.shape(),
                self.out_channels,
                self.bias
            )));
        }
        Ok(())
    }
}

/// Float 2D convolution layer.
#[derive(Debug)]
pub struct Conv2d {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub options: Conv2dOptions,
}

impl Conv2d {
    pub fn new(options: Conv2dOptions) -> Result<Self> {
        let (weight, bias) = options.init_parameters()?;
        Ok(Self {
            weight,
            bias,
            options,
        })
    }
}

impl Module for Conv2d {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        conv::conv2d(input, &self.weight, self.bias.as_ref(), &self.options.geometry())
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut p = vec![self.weight.clone()];
        if let Some(b) = &self.bias {
            p.push(b.clone());
        }
        p
    }
}

/// A stack of layers applied in sequence.
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl Sequential {
    pub fn new(layers: Vec<Box<dyn Module>>) -> Self {
        Self { layers }
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&mut self, input: &Tensor) -> Result<Tensor> {
        self.layers
            .iter_mut()
            .try_fold(input.clone(), |x, l| l.forward(&x))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::ReLU;

    #[test]
    fn test_conv2d_options_defaults() {
        let options = Conv2dOptions::new(3, 8, (3, 3));
        assert_eq!(options.stride, (1, 1));
        assert_eq!(options.padding, (0, 0));
        assert_eq!(options.groups, 1);
        assert!(options.bias);
        assert_eq!(options.padding_mode, PaddingMode::Zeros);
        assert_eq!(options.weight_shape(), [8, 3, 3, 3]);
    }

    #[test]
    fn test_conv2d_options_validation() {
        assert!(matches!(
            Conv2dOptions::new(3, 4, (1, 1)).with_groups(2).validate(),
            Err(QatError::InvalidConfig(_))
        ));
        assert!(matches!(
            Conv2dOptions::new(4, 3, (1, 1)).with_groups(2).validate(),
            Err(QatError::InvalidConfig(_))
        ));
        assert!(matches!(
            Conv2dOptions::new(4, 4, (0, 1)).validate(),
            Err(QatError::InvalidConfig(_))
        ));
        assert!(matches!(
            Conv2dOptions::new(4, 4, (1, 1)).with_groups(0).validate(),
            Err(QatError::InvalidConfig(_))
        ));
        assert!(Conv2dOptions::new(4, 6, (3, 3)).with_groups(2).validate().is_ok());
    }

    #[test]
    fn test_conv2d_init_bounds() {
        let conv = Conv2d::new(Conv2dOptions::new(2, 4, (3, 3))).unwrap();
        let bound = 1.0 / 18f32.sqrt();
        assert_eq!(conv.weight.shape(), &[4, 2, 3, 3]);
        assert!(conv.weight.requires_grad);
        assert!(conv.weight.data().iter().all(|v| v.abs() <= bound));
        assert_eq!(conv.bias.as_ref().unwrap().shape(), &[4]);
        assert_eq!(conv.parameters().len(), 2);
    }

    #[test]
    fn test_sequential_conv_relu() {
        let mut conv = Conv2d::new(Conv2dOptions::new(1, 1, (1, 1)).with_bias(false)).unwrap();
        conv.weight.data_mut()[0] = -1.0;
        let mut model = Sequential::new(vec![Box::new(conv), Box::new(ReLU)]);
        assert_eq!(model.len(), 2);

        let x = Tensor::new(vec![1.0, -2.0], &[1, 1, 1, 2]);
        let y = model.forward(&x).unwrap();
        assert_eq!(y.to_vec(), vec![0.0, 2.0]);
        assert_eq!(model.parameters().len(), 1);
    }
}
