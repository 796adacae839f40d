//! Autograd engine: the contract custom differentiable ops are wired into.
//!
//! An op computes its forward result outside the graph, builds a `GradFn`
//! that owns everything backward needs (its saved context), and registers
//! it with `record_op`. Only tensor inputs that can receive a gradient are
//! passed to `record_op`; scalars, flags and index tensors never appear in
//! the graph.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{FuseError, Result, Tensor};

// ============================================================================
// GradFn trait
// ============================================================================

/// Backward half of a differentiable operation.
pub trait GradFn: Send + Sync {
    /// Compute one optional gradient per recorded input.
    ///
    /// The returned vector must have exactly as many entries as inputs were
    /// recorded; `None` means no gradient flows to that input.
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>>;

    /// Name of this gradient function (for debugging).
    fn name(&self) -> &str;
}

// ============================================================================
// GradNode
// ============================================================================

static NEXT_NODE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A node in the autograd graph.
///
/// Interior nodes own their `GradFn` (and with it the op's saved context)
/// until a non-retaining backward consumes it. Leaf nodes only accumulate.
pub struct GradNode {
    pub id: usize,
    grad_fn: Mutex<Option<Box<dyn GradFn>>>,
    leaf: bool,
    inputs: Vec<Option<Arc<GradNode>>>,
    grad: RwLock<Option<Tensor>>,
}

impl GradNode {
    /// New leaf node (a parameter or user input).
    pub fn leaf() -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: Mutex::new(None),
            leaf: true,
            inputs: Vec::new(),
            grad: RwLock::new(None),
        })
    }

    /// New interior node. `inputs[i]` receives the i-th gradient returned
    /// by `grad_fn`; `None` entries are inputs that do not track gradients.
    pub fn with_grad_fn(grad_fn: Box<dyn GradFn>, inputs: Vec<Option<Arc<GradNode>>>) -> Arc<Self> {
        Arc::new(Self {
            id: next_id(),
            grad_fn: Mutex::new(Some(grad_fn)),
            leaf: false,
            inputs,
            grad: RwLock::new(None),
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    /// Whether this node still owns its backward function and saved state.
    pub fn has_saved_context(&self) -> bool {
        self.grad_fn.lock().is_some()
    }

    /// Name of the attached gradient function, if any.
    pub fn grad_fn_name(&self) -> Option<String> {
        self.grad_fn.lock().as_ref().map(|f| f.name().to_string())
    }

    /// Add `grad` to the accumulated gradient.
    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let mut slot = self.grad.write();
        let next = match slot.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.detach(),
        };
        *slot = Some(next);
        Ok(())
    }

    pub fn get_grad(&self) -> Option<Tensor> {
        self.grad.read().clone()
    }

    pub fn zero_grad(&self) {
        *self.grad.write() = None;
    }
}

// ============================================================================
// Op registration
// ============================================================================

/// Whether any of `inputs` requires a graph node under the current grad mode.
pub fn any_tracks_grad(inputs: &[&Tensor]) -> bool {
    is_grad_enabled() && inputs.iter().any(|t| t.tracks_grad())
}

/// Attach `grad_fn` to `output` with `inputs` as its differentiable inputs.
///
/// Callers check `any_tracks_grad` first so that no saved context is built
/// when nothing will ever run backward.
pub fn record_op(output: Tensor, grad_fn: Box<dyn GradFn>, inputs: &[&Tensor]) -> Tensor {
    let edges = inputs
        .iter()
        .map(|t| if t.tracks_grad() { t.grad_node().cloned() } else { None })
        .collect();
    output.with_grad_node(GradNode::with_grad_fn(grad_fn, edges))
}

// ============================================================================
// Backward pass
// ============================================================================

/// Backpropagate from `root`, releasing each saved context once applied.
pub fn backward(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    run_backward(root, grad_output, false)
}

/// Backpropagate from `root` and keep every saved context.
pub fn backward_retain_graph(root: &Arc<GradNode>, grad_output: Tensor) -> Result<()> {
    run_backward(root, grad_output, true)
}

fn run_backward(root: &Arc<GradNode>, grad_output: Tensor, retain_graph: bool) -> Result<()> {
    // Gradients are staged per node and only reach leaves, and saved
    // contexts are only released, once every node applied successfully.
    // A failed pass leaves the graph as it found it.
    let mut pending: HashMap<usize, Tensor> = HashMap::new();
    pending.insert(root.id, grad_output);
    let mut leaf_grads = Vec::new();
    let mut applied = Vec::new();

    for node in topological_order(root) {
        let Some(node_grad) = pending.remove(&node.id) else {
            continue;
        };
        if node.is_leaf() {
            leaf_grads.push((node, node_grad));
            continue;
        }

        let input_grads = {
            let slot = node.grad_fn.lock();
            let grad_fn = slot.as_ref().ok_or_else(released)?;
            let grads = grad_fn.apply(&node_grad)?;
            if grads.len() != node.inputs.len() {
                return Err(FuseError::Autograd(format!(
                    "{} returned {} gradients for {} inputs",
                    grad_fn.name(),
                    grads.len(),
                    node.inputs.len()
                )));
            }
            grads
        };

        for (input, grad) in node.inputs.iter().zip(input_grads) {
            if let (Some(input), Some(grad)) = (input, grad) {
                let next = match pending.remove(&input.id) {
                    Some(existing) => existing.add(&grad)?,
                    None => grad,
                };
                pending.insert(input.id, next);
            }
        }
        applied.push(node);
    }

    for (leaf, grad) in leaf_grads {
        leaf.accumulate_grad(&grad)?;
    }
    if !retain_graph {
        for node in applied {
            if let Some(grad_fn) = node.grad_fn.lock().take() {
                tracing::trace!(grad_fn = grad_fn.name(), "releasing saved context");
            }
        }
    }
    Ok(())
}

fn released() -> FuseError {
    FuseError::Autograd(
        "saved context was already released by a previous backward; \
         use backward_retain_graph to run backward more than once"
            .into(),
    )
}

/// Nodes ordered so that every node precedes all of its inputs.
fn topological_order(root: &Arc<GradNode>) -> Vec<Arc<GradNode>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Arc<GradNode>, bool)> = vec![(Arc::clone(root), false)];

    while let Some((node, expanded)) = stack.pop() {
        if expanded {
            order.push(node);
            continue;
        }
        if !visited.insert(node.id) {
            continue;
        }
        stack.push((Arc::clone(&node), true));
        for input in node.inputs.iter().flatten() {
            if !visited.contains(&input.id) {
                stack.push((Arc::clone(input), false));
            }
        }
    }

    order.reverse();
    order
}

// ============================================================================
// No-grad scope
// ============================================================================

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether ops on this thread currently record graph nodes.
pub fn is_grad_enabled() -> bool {
    GRAD_ENABLED.with(|g| g.get())
}

fn set_grad_enabled(enabled: bool) -> bool {
    GRAD_ENABLED.with(|g| g.replace(enabled))
}

/// RAII guard that disables graph recording in its scope.
pub struct NoGradGuard {
    prev: bool,
}

impl NoGradGuard {
    pub fn new() -> Self {
        Self {
            prev: set_grad_enabled(false),
        }
    }
}

impl Default for NoGradGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for NoGradGuard {
    fn drop(&mut self) {
        set_grad_enabled(self.prev);
    }
}
