//! Running min/max statistics and the range → params mapping.

use super::affine::QuantizationParams;
use super::config::{Granularity, QuantScheme};
use crate::error::{QatError, Result};
use crate::Tensor;

/// Running min/max observer, per tensor or per channel.
///
/// Bounds start at `+∞/−∞` and only ever widen.
#[derive(Debug, Clone)]
pub struct MinMaxObserver {
    granularity: Granularity,
    min_values: Vec<f32>,
    max_values: Vec<f32>,
    num_observations: usize,
}

impl MinMaxObserver {
    pub fn new(granularity: Granularity) -> Self {
        let (min_values, max_values) = match granularity {
            Granularity::PerTensor => (vec![f32::INFINITY], vec![f32::NEG_INFINITY]),
            // channel count is only known once a tensor is seen
            Granularity::PerChannel { .. } => (Vec::new(), Vec::new()),
        };
        Self {
            granularity,
            min_values,
            max_values,
            num_observations: 0,
        }
    }

    /// Merge the finite extrema of `tensor` into the running bounds.
    pub fn observe(&mut self, tensor: &Tensor) -> Result<()> {
        let data = tensor.data();
        let mut skipped = 0usize;

        match self.granularity {
            Granularity::PerTensor => {
                for &v in data.iter() {
                    if v.is_finite() {
                        self.min_values[0] = self.min_values[0].min(v);
                        self.max_values[0] = self.max_values[0].max(v);
                    } else {
                        skipped += 1;
                    }
                }
            }
            Granularity::PerChannel { axis } => {
                let shape = tensor.shape();
                let Some(&channels) = shape.get(axis) else {
                    return Err(QatError::ShapeMismatch(format!(
                        "channel axis {axis} out of range for shape {shape:?}"
                    )));
                };
                if self.min_values.is_empty() {
                    self.min_values = vec![f32::INFINITY; channels];
                    self.max_values = vec![f32::NEG_INFINITY; channels];
                } else if self.min_values.len() != channels {
                    return Err(QatError::ShapeMismatch(format!(
                        "observer tracks {} channels, tensor has {channels} along axis {axis}",
                        self.min_values.len()
                    )));
                }

                let inner: usize = shape[axis + 1..].iter().product();
                for (i, &v) in data.iter().enumerate() {
                    if v.is_finite() {
                        let c = (i / inner) % channels;
                        self.min_values[c] = self.min_values[c].min(v);
                        self.max_values[c] = self.max_values[c].max(v);
                    } else {
                        skipped += 1;
                    }
                }
            }
        }

        if skipped > 0 {
            tracing::warn!(skipped, "non-finite values ignored by observer");
        }
        self.num_observations += 1;
        Ok(())
    }

    /// True once every tracked channel has seen at least one finite value.
    pub fn is_initialized(&self) -> bool {
        !self.min_values.is_empty()
            && self
                .min_values
                .iter()
                .zip(&self.max_values)
                .all(|(lo, hi)| lo <= hi)
    }

    pub fn min_values(&self) -> &[f32] {
        &self.min_values
    }

    pub fn max_values(&self) -> &[f32] {
        &self.max_values
    }

    /// Minimum over all channels (`+∞` before any observation).
    pub fn global_min(&self) -> f32 {
        self.min_values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    /// Maximum over all channels (`−∞` before any observation).
    pub fn global_max(&self) -> f32 {
        self.max_values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn num_observations(&self) -> usize {
        self.num_observations
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.granularity);
    }

    /// One set of params per tracked channel (one for per-tensor).
    pub fn calculate_qparams(
        &self,
        qmin: i32,
        qmax: i32,
        scheme: QuantScheme,
    ) -> Result<Vec<QuantizationParams>> {
        if self.min_values.is_empty() {
            return Err(QatError::UninitializedQuantizer);
        }
        self.min_values
            .iter()
            .zip(&self.max_values)
            .map(|(&lo, &hi)| calculate_qparams(lo, hi, qmin, qmax, scheme))
            .collect()
    }
}

/// Map an observed `[min, max]` onto `[qmin, qmax]`.
///
/// The range is widened to include zero so that zero is exactly representable.
/// Fails with [`QatError::UninitializedQuantizer`] when `min > max`.
pub fn calculate_qparams(
    min: f32,
    max: f32,
    qmin: i32,
    qmax: i32,
    scheme: QuantScheme,
) -> Result<QuantizationParams> {
    if min > max {
        return Err(QatError::UninitializedQuantizer);
    }
    if qmin >= qmax {
        return Err(QatError::InvalidConfig(format!(
            "qmin ({qmin}) must be smaller than qmax ({qmax})"
        )));
    }

    let min = min.min(0.0);
    let max = max.max(0.0);
    let levels = (i64::from(qmax) - i64::from(qmin)) as f32;

    let (scale, zero_point) = if min == max {
        (1.0, if scheme == QuantScheme::Symmetric { midpoint(qmin, qmax) } else { 0 })
    } else {
        match scheme {
            QuantScheme::Symmetric => {
                let abs_max = max.max(-min);
                let scale = (abs_max / (levels / 2.0)).max(f32::EPSILON);
                (scale, midpoint(qmin, qmax))
            }
            QuantScheme::Affine => {
                let scale = ((max - min) / levels).max(f32::EPSILON);
                let zero_point = qmin as f32 - (min / scale).round();
                (scale, zero_point as i32)
            }
        }
    };

    QuantizationParams::new(scale, zero_point.clamp(qmin, qmax), qmin, qmax)
}

// i64 so the int32 range does not overflow; the result lies in [qmin, qmax]
fn midpoint(qmin: i32, qmax: i32) -> i32 {
    let mid = (i64::from(qmin) + i64::from(qmax) + 1).div_euclid(2);
    mid.clamp(i64::from(qmin), i64::from(qmax)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantization::FakeQuantConfig;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_minmax_observer() {
        let mut observer = MinMaxObserver::new(Granularity::PerTensor);
        assert!(!observer.is_initialized());

        observer.observe(&Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2])).unwrap();
        assert_eq!(observer.num_observations(), 1);
        assert_eq!(observer.global_min(), 1.0);
        assert_eq!(observer.global_max(), 4.0);

        // a narrower tensor does not shrink the bounds
        observer.observe(&Tensor::new(vec![2.0, 3.0], &[2])).unwrap();
        assert_eq!(observer.global_min(), 1.0);
        assert_eq!(observer.global_max(), 4.0);

        observer.observe(&Tensor::new(vec![-1.0, 9.0], &[2])).unwrap();
        assert_eq!(observer.global_min(), -1.0);
        assert_eq!(observer.global_max(), 9.0);
    }

    #[test]
    fn test_non_finite_values_skipped() {
        let mut observer = MinMaxObserver::new(Granularity::PerTensor);
        observer
            .observe(&Tensor::new(vec![f32::NAN, 1.0, f32::INFINITY, -2.0], &[4]))
            .unwrap();
        assert_eq!(observer.global_min(), -2.0);
        assert_eq!(observer.global_max(), 1.0);
    }

    #[test]
    fn test_per_channel_observer() {
        let mut observer = MinMaxObserver::new(Granularity::PerChannel { axis: 0 });
        assert!(observer.calculate_qparams(-128, 127, QuantScheme::Symmetric).is_err());

        let w = Tensor::new(vec![1.0, -2.0, 0.5, 0.25], &[2, 1, 1, 2]);
        observer.observe(&w).unwrap();
        assert_eq!(observer.min_values(), &[-2.0, 0.25]);
        assert_eq!(observer.max_values(), &[1.0, 0.5]);

        let mismatch = Tensor::zeros(&[3, 1, 1, 2]);
        assert!(matches!(observer.observe(&mismatch), Err(QatError::ShapeMismatch(_))));

        let params = observer.calculate_qparams(-128, 127, QuantScheme::Symmetric).unwrap();
        assert_eq!(params.len(), 2);
        assert_abs_diff_eq!(params[0].scale, 2.0 / 127.5, epsilon = 1e-7);
        assert_abs_diff_eq!(params[1].scale, 0.5 / 127.5, epsilon = 1e-7);
    }

    #[test]
    fn test_symmetric_qparams() {
        let p = calculate_qparams(-1.0, 2.0, -128, 127, QuantScheme::Symmetric).unwrap();
        assert_abs_diff_eq!(p.scale, 2.0 / 127.5, epsilon = 1e-7);
        assert_eq!(p.zero_point, 0);

        let u = calculate_qparams(-1.0, 2.0, 0, 255, QuantScheme::Symmetric).unwrap();
        assert_eq!(u.zero_point, 128);
    }

    #[test]
    fn test_affine_qparams() {
        let p = calculate_qparams(-1.0, 3.0, 0, 255, QuantScheme::Affine).unwrap();
        assert_abs_diff_eq!(p.scale, 4.0 / 255.0, epsilon = 1e-7);
        assert_eq!(p.zero_point, 64); // 0 - round(-1 / (4/255)) = round(63.75)

        // all-positive range is widened to include zero
        let q = calculate_qparams(2.0, 4.0, 0, 255, QuantScheme::Affine).unwrap();
        assert_eq!(q.zero_point, 0);
        assert_abs_diff_eq!(q.scale, 4.0 / 255.0, epsilon = 1e-7);
    }

    #[test]
    fn test_degenerate_and_uninitialized_ranges() {
        let p = calculate_qparams(0.0, 0.0, 0, 255, QuantScheme::Affine).unwrap();
        assert_eq!(p.scale, 1.0);
        assert_eq!(p.zero_point, 0);

        assert_eq!(
            calculate_qparams(f32::INFINITY, f32::NEG_INFINITY, 0, 255, QuantScheme::Affine),
            Err(QatError::UninitializedQuantizer)
        );
    }

    #[test]
    fn test_int32_range_qparams() {
        for scheme in [QuantScheme::Symmetric, QuantScheme::Affine] {
            let p = calculate_qparams(-1.0, 2.0, i32::MIN, i32::MAX, scheme).unwrap();
            assert!(p.scale > 0.0 && p.scale.is_finite());
            assert!((i32::MIN..=i32::MAX).contains(&p.zero_point));
        }
        let sym = calculate_qparams(-1.0, 2.0, i32::MIN, i32::MAX, QuantScheme::Symmetric).unwrap();
        assert_eq!(sym.zero_point, 0);

        let degenerate = calculate_qparams(0.0, 0.0, 0, i32::MAX, QuantScheme::Symmetric).unwrap();
        assert_eq!(degenerate.zero_point, 1 << 30);
    }

    #[test]
    fn test_int32_range_apply() {
        let mut fq = FakeQuantConfig::weight()
            .with_range(i32::MIN, i32::MAX)
            .build()
            .unwrap();
        let y = fq.apply(&Tensor::new(vec![-1.0, 2.0], &[2])).unwrap();
        assert_eq!(y.shape(), &[2]);
        assert!(y.data().iter().all(|v| v.is_finite()));

        let (lo, hi) = fq.params()[0].real_range();
        assert!(lo < 0.0 && hi > 0.0);
    }
}
