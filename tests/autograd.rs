use qat_fuse::{
    quantization::{fake_quantize_per_tensor, QuantizationParams},
    Tape, Tensor,
};

#[inline]
fn s(t: &Tensor) -> f32 {
    t.data()[0]
}

macro_rules! g {
    ($t:expr) => {
        $t.grad().map(|t| t.data()[0]).unwrap_or(0.0)
    };
}

#[test]
fn mul_grads() {
    Tape::reset();
    let x = Tensor::scalar(2.0).requires_grad();
    let y = Tensor::scalar(3.0).requires_grad();
    let z = &x * &y;
    z.backward();

    assert!((s(&z) - 6.0).abs() < 1e-6);
    assert!((g!(x) - 3.0).abs() < 1e-6);
    assert!((g!(y) - 2.0).abs() < 1e-6);
}

#[test]
fn squared_error_grads() {
    Tape::reset();
    let pred = Tensor::new(vec![1.0, 4.0], &[2]).requires_grad();
    let target = Tensor::new(vec![0.0, 2.0], &[2]);
    let diff = &pred - &target;
    let loss = (&diff * &diff).mean(); // (1 + 4) / 2
    loss.backward();

    assert!((s(&loss) - 2.5).abs() < 1e-6);
    // d/dp mean((p - t)^2) = (p - t)
    let grad = pred.grad_ref().unwrap();
    assert!((grad[0] - 1.0).abs() < 1e-6);
    assert!((grad[1] - 2.0).abs() < 1e-6);
}

#[test]
fn relu_masks_gradient() {
    Tape::reset();
    let x = Tensor::new(vec![-1.0, 0.0, 2.0], &[3]).requires_grad();
    x.relu().mean().backward();

    let grad = x.grad().unwrap().to_vec();
    assert_eq!(grad[0], 0.0);
    assert_eq!(grad[1], 0.0);
    assert!((grad[2] - 1.0 / 3.0).abs() < 1e-6);
}

#[test]
fn straight_through_inside_chain() {
    Tape::reset();
    let params = QuantizationParams::new(0.5, 0, -4, 3).unwrap();
    // 0.3 -> 0.5 passes, 5.0 -> clamped to 1.5
    let x = Tensor::new(vec![0.3, 5.0], &[2]).requires_grad();
    let y = fake_quantize_per_tensor(&x, &params).unwrap();
    let scaled = &y * &Tensor::new(vec![2.0, 2.0], &[2]);
    scaled.backward();

    assert_eq!(y.to_vec(), vec![0.5, 1.5]);
    assert_eq!(x.grad().unwrap().to_vec(), vec![2.0, 0.0]);
}

#[test]
fn clones_share_gradient_buffer() {
    Tape::reset();
    let w = Tensor::scalar(3.0).requires_grad();
    let handle = w.clone();
    (&w * &w).backward();

    assert!((g!(handle) - 6.0).abs() < 1e-6);
    handle.zero_grad();
    assert!(w.grad().is_none());
}

#[test]
fn no_tape_without_requires_grad() {
    Tape::reset();
    let tape = Tape::new();
    let a = Tensor::scalar(1.0);
    let b = Tensor::scalar(2.0);
    let _ = &a * &b;
    assert!(tape.is_empty());

    let c = Tensor::scalar(1.0).requires_grad();
    let _ = &c * &b;
    assert_eq!(tape.len(), 1);
}
