use crate::{ops, tape::Tape};
use rand::distributions::{Distribution, Uniform};
use smallvec::SmallVec;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::Rc;

/// Dense f32 tensor with shared storage.
///
/// Cloning is shallow: the clone shares data *and* gradient buffer, which is
/// how a module hands its learnable parameters out without copying them.
#[derive(Clone)]
pub struct Tensor {
    data: Rc<RefCell<Vec<f32>>>,
    pub(crate) shape: SmallVec<[usize; 4]>,
    // In-place gradient accumulation buffer (allocated on demand)
    pub grad: Rc<RefCell<Option<Vec<f32>>>>,
    pub requires_grad: bool,
    pub tape_node: Cell<Option<usize>>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("data", &self.data.borrow().as_slice())
            .field("shape", &self.shape)
            .field("requires_grad", &self.requires_grad)
            .field("has_grad", &self.grad.borrow().is_some())
            .finish()
    }
}

impl Tensor {
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Self {
        debug_assert_eq!(
            data.len(),
            shape.iter().product::<usize>(),
            "data length does not match shape {shape:?}"
        );
        Tensor {
            data: Rc::new(RefCell::new(data)),
            shape: shape.iter().cloned().collect(),
            grad: Rc::new(RefCell::new(None)),
            requires_grad: false,
            tape_node: Cell::new(None),
        }
    }

    pub fn zeros(shape: &[usize]) -> Self {
        Tensor::new(vec![0.0; shape.iter().product()], shape)
    }

    pub fn scalar(value: f32) -> Self {
        Tensor::new(vec![value], &[1])
    }

    /// Values drawn from the standard normal distribution.
    pub fn randn(shape: &[usize]) -> Tensor {
        use rand_distr::StandardNormal;
        let mut rng = rand::thread_rng();

        let size: usize = shape.iter().product();
        let data: Vec<f32> = (0..size).map(|_| StandardNormal.sample(&mut rng)).collect();

        Tensor::new(data, shape)
    }

    /// Values drawn uniformly from `[-bound, bound]`.
    pub fn uniform(shape: &[usize], bound: f32) -> Tensor {
        let size: usize = shape.iter().product();
        if bound <= 0.0 {
            return Tensor::zeros(shape);
        }
        let dist = Uniform::new_inclusive(-bound, bound);
        let mut rng = rand::thread_rng();
        let data: Vec<f32> = (0..size).map(|_| dist.sample(&mut rng)).collect();
        Tensor::new(data, shape)
    }

    pub fn requires_grad(mut self) -> Self {
        self.requires_grad = true;
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn data(&self) -> Ref<'_, Vec<f32>> {
        self.data.borrow()
    }

    /// Mutable access to the shared storage. Every clone sees the write.
    pub fn data_mut(&self) -> RefMut<'_, Vec<f32>> {
        self.data.borrow_mut()
    }

    /// Copy of the values, detached from storage and tape.
    pub fn to_vec(&self) -> Vec<f32> {
        self.data.borrow().clone()
    }

    /// Whether two handles point at the same storage.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Rc::ptr_eq(&self.data, &other.data)
    }

    /// Zero-copy view of gradient buffer, if present.
    pub fn grad_ref(&self) -> Option<Ref<'_, Vec<f32>>> {
        Ref::filter_map(self.grad.borrow(), |opt| opt.as_ref()).ok()
    }

    /// Materializes a Tensor from the grad buffer (allocates).
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_ref().map(|g| Tensor::new(g.clone(), &self.shape))
    }

    /// Seeds `dL/dself = 1` for every element and walks the tape.
    pub fn backward(&self) {
        let ones = vec![1.0; self.numel()];
        *self.grad.borrow_mut() = Some(ones);

        if let Some(node_id) = self.tape_node.get() {
            crate::tape::backward(node_id);
        }
    }

    pub fn zero_grad(&self) {
        *self.grad.borrow_mut() = None;
    }

    /// Mean of all elements
    pub fn mean(&self) -> Tensor {
        let data = self.data();
        let mean_val = data.iter().sum::<f32>() / data.len() as f32;

        let mut output = Tensor::scalar(mean_val);

        if self.requires_grad {
            output.requires_grad = true;

            let input = self.clone();
            let out = output.clone();
            let n = data.len() as f32;

            Tape::push_unary_op(self, &output, move || {
                if let Some(gout) = out.grad_ref() {
                    let g_each = gout[0] / n;
                    let grad_vec = vec![g_each; input.numel()];
                    ops::accumulate_grad(&input, &grad_vec);
                }
            });
        }

        output
    }
}
