use crate::{tape::Tape, Tensor};
use std::ops::{Mul, Sub};

impl Mul for &Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.numel(),
            other.numel(),
            "Tensor dimensions must match"
        );

        let out_data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a * b)
            .collect();

        let mut out = Tensor::new(out_data, &self.shape);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    if a.requires_grad {
                        let ga: Vec<f32> =
                            gout.iter().zip(b.data().iter()).map(|(&g, &v)| g * v).collect();
                        accumulate_grad(&a, &ga);
                    }
                    if b.requires_grad {
                        let gb: Vec<f32> =
                            gout.iter().zip(a.data().iter()).map(|(&g, &v)| g * v).collect();
                        accumulate_grad(&b, &gb);
                    }
                }
            });
        }
        out
    }
}

impl Sub for &Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        assert_eq!(
            self.numel(),
            other.numel(),
            "Tensor dimensions must match"
        );

        let out_data: Vec<f32> = self
            .data()
            .iter()
            .zip(other.data().iter())
            .map(|(&a, &b)| a - b)
            .collect();

        let mut out = Tensor::new(out_data, &self.shape);

        if self.requires_grad || other.requires_grad {
            out.requires_grad = true;
            let a = self.clone();
            let b = other.clone();
            let o = out.clone();

            Tape::push_binary_op(self, other, &out, move || {
                if let Some(gout) = o.grad_ref() {
                    if a.requires_grad {
                        accumulate_grad(&a, &gout);
                    }
                    if b.requires_grad {
                        accumulate_grad_scaled(&b, &gout, -1.0);
                    }
                }
            });
        }
        out
    }
}

impl Mul<&Tensor> for Tensor {
    type Output = Tensor;
    fn mul(self, other: &Tensor) -> Tensor {
        (&self).mul(other)
    }
}

impl Mul for Tensor {
    type Output = Tensor;
    fn mul(self, other: Tensor) -> Tensor {
        (&self).mul(&other)
    }
}

impl Sub<&Tensor> for Tensor {
    type Output = Tensor;
    fn sub(self, other: &Tensor) -> Tensor {
        (&self).sub(other)
    }
}

impl Sub for Tensor {
    type Output = Tensor;
    fn sub(self, other: Tensor) -> Tensor {
        (&self).sub(&other)
    }
}

// Helper function to accumulate gradients
#[inline]
pub fn accumulate_grad(t: &Tensor, src: &[f32]) {
    accumulate_grad_scaled(t, src, 1.0);
}

#[inline]
pub fn accumulate_grad_scaled(t: &Tensor, src: &[f32], scale: f32) {
    let mut slot = t.grad.borrow_mut();
    let g = slot.get_or_insert_with(|| vec![0.0; t.numel()]);
    for (gi, &s) in g.iter_mut().zip(src) {
        *gi += scale * s;
    }
}

impl Tensor {
    /// Elementwise `max(x, 0)`.
    pub fn relu(&self) -> Tensor {
        self.clamp_activation(0.0, f32::INFINITY)
    }

    /// Elementwise `min(max(x, 0), 6)`.
    pub fn relu6(&self) -> Tensor {
        self.clamp_activation(0.0, 6.0)
    }

    // Gradient passes where lo < x < hi.
    fn clamp_activation(&self, lo: f32, hi: f32) -> Tensor {
        let result: Vec<f32> = self.data().iter().map(|&x| x.max(lo).min(hi)).collect();

        let mut output = Tensor::new(result, &self.shape);

        if self.requires_grad {
            output.requires_grad = true;
            let input = self.clone();
            let out = output.clone();

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let gin: Vec<f32> = gout
                        .iter()
                        .zip(input.data().iter())
                        .map(|(&g, &v)| if v > lo && v < hi { g } else { 0.0 })
                        .collect();
                    accumulate_grad(&input, &gin);
                }
            });
        }

        output
    }
}
