use std::cell::RefCell;
use std::rc::Rc;

use crate::tensor::Tensor;

thread_local! {
    static TAPE: RefCell<Option<Rc<RefCell<TapeInner>>>> = const { RefCell::new(None) };
}

/// Handle to the thread-local gradient tape.
pub struct Tape {
    inner: Rc<RefCell<TapeInner>>,
}

struct TapeInner {
    // Store closures as Rc so we can clone them out of the borrow and run safely.
    nodes: Vec<Node>,
}

struct Node {
    backward_fn: Rc<dyn Fn()>,
}

impl Tape {
    /// Ensure a tape exists for this thread and return a handle.
    pub fn new() -> Self {
        Tape { inner: Self::active() }
    }

    fn active() -> Rc<RefCell<TapeInner>> {
        TAPE.with(|t| {
            t.borrow_mut()
                .get_or_insert_with(|| Rc::new(RefCell::new(TapeInner { nodes: Vec::new() })))
                .clone()
        })
    }

    /// Clear recorded nodes but keep the tape alive.
    pub fn reset() {
        TAPE.with(|t| {
            if let Some(rc) = t.borrow().as_ref() {
                rc.borrow_mut().nodes.clear();
            }
        });
    }

    /// Number of recorded backward nodes.
    pub fn len(&self) -> usize {
        self.inner.borrow().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record<F>(output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        let rc = Self::active();
        let id = {
            let mut inner = rc.borrow_mut();
            let id = inner.nodes.len();
            inner.nodes.push(Node {
                backward_fn: Rc::new(backward_fn),
            });
            id
        };
        // stamp after releasing inner borrow
        output.tape_node.set(Some(id));
    }

    pub fn push_binary_op<F>(a: &Tensor, b: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !(a.requires_grad || b.requires_grad) {
            return;
        }
        Self::record(output, backward_fn);
    }

    pub fn push_unary_op<F>(input: &Tensor, output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !input.requires_grad {
            return;
        }
        Self::record(output, backward_fn);
    }

    /// Records an op with any number of inputs (convolution: input, weight, bias).
    pub fn push_op<F>(inputs: &[&Tensor], output: &Tensor, backward_fn: F)
    where
        F: Fn() + 'static,
    {
        if !inputs.iter().any(|t| t.requires_grad) {
            return;
        }
        Self::record(output, backward_fn);
    }
}

impl Default for Tape {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute backward functions up to `final_node_id` (inclusive), in reverse.
/// Closures are cloned out first so no RefCell borrow is held while they run.
pub fn backward(final_node_id: usize) {
    let fns: Vec<Rc<dyn Fn()>> = TAPE.with(|t| {
        let Some(rc) = t.borrow().as_ref().cloned() else {
            return Vec::new();
        };
        let inner = rc.borrow();
        if inner.nodes.is_empty() {
            return Vec::new();
        }
        let end = final_node_id.min(inner.nodes.len() - 1);
        inner.nodes[..=end]
            .iter()
            .map(|n| n.backward_fn.clone())
            .collect()
    });

    for f in fns.into_iter().rev() {
        (f)();
    }
}
