//! Computation graph nodes.
//!
//! A [`Variable`] owns the [`FunctionNode`] that created it; a function node
//! owns its inputs and only weakly refers to its outputs. Ownership therefore
//! always points from later nodes to earlier ones and the graph is freed as
//! soon as the last handle to its outputs goes away.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::backend::Backend;
use crate::error::{AutodiffError, Result};
use crate::function::Function;
use crate::mode;
use crate::shape::Shape;
use crate::tensor::TensorData;

/// Global counter for unique node IDs.
static NODE_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_node_id() -> NodeId {
    NodeId(NODE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

/// Unique identifier for a node in the computation graph.
///
/// IDs grow monotonically, so they also record creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

pub(crate) struct VariableNode<B: Backend> {
    pub(crate) id: NodeId,
    pub(crate) name: Option<String>,
    pub(crate) data: B::Tensor,
    pub(crate) generation: usize,
    pub(crate) creator: Option<Rc<FunctionNode<B>>>,
    pub(crate) grad: RefCell<Option<Variable<B>>>,
}

/// A tensor value taking part in the computation graph.
///
/// Cloning is cheap and yields another handle to the same node, sharing its
/// gradient slot.
pub struct Variable<B: Backend>(pub(crate) Rc<VariableNode<B>>);

impl<B: Backend> Clone for Variable<B> {
    fn clone(&self) -> Self {
        Variable(Rc::clone(&self.0))
    }
}

impl<B: Backend> std::fmt::Debug for Variable<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("shape", self.shape())
            .field("generation", &self.0.generation)
            .field("creator", &self.creator_name())
            .finish()
    }
}

impl<B: Backend> Variable<B> {
    fn from_parts(
        data: B::Tensor,
        name: Option<String>,
        generation: usize,
        creator: Option<Rc<FunctionNode<B>>>,
    ) -> Self {
        Variable(Rc::new(VariableNode {
            id: next_node_id(),
            name,
            data,
            generation,
            creator,
            grad: RefCell::new(None),
        }))
    }

    // === Constructors ===

    /// Create a leaf variable.
    pub fn new(data: B::Tensor) -> Self {
        Self::from_parts(data, None, 0, None)
    }

    /// Create a named leaf variable.
    pub fn named(name: &str, data: B::Tensor) -> Self {
        Self::from_parts(data, Some(name.to_string()), 0, None)
    }

    /// Create a leaf from flat data and a shape.
    pub fn from_vec(data: Vec<f32>, shape: Shape) -> Self {
        Self::new(B::from_vec(data, shape))
    }

    /// Create a 0-dim leaf holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::new(B::scalar(value))
    }

    // === Accessors ===

    /// Get unique node ID.
    pub fn id(&self) -> NodeId {
        self.0.id
    }

    /// Get the variable name, if one was given.
    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    /// Get the tensor data.
    pub fn data(&self) -> &B::Tensor {
        &self.0.data
    }

    /// Get the shape.
    pub fn shape(&self) -> &Shape {
        self.0.data.shape()
    }

    /// Get number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape().ndim()
    }

    /// Get number of elements.
    pub fn numel(&self) -> usize {
        self.shape().numel()
    }

    /// Get data as slice (for reading values).
    pub fn as_slice(&self) -> &[f32] {
        self.0.data.as_slice()
    }

    /// Get scalar value.
    pub fn item(&self) -> f32 {
        self.0.data.scalar_value()
    }

    /// Depth in the graph: 0 for leaves, creator generation + 1 otherwise.
    pub fn generation(&self) -> usize {
        self.0.generation
    }

    /// True when no function produced this variable.
    pub fn is_leaf(&self) -> bool {
        self.0.creator.is_none()
    }

    /// Name of the function that produced this variable.
    pub fn creator_name(&self) -> Option<&'static str> {
        self.0.creator.as_ref().map(|c| c.name)
    }

    pub(crate) fn creator(&self) -> Option<&Rc<FunctionNode<B>>> {
        self.0.creator.as_ref()
    }

    // === Gradients ===

    /// The accumulated gradient, if backward has reached this variable.
    pub fn grad(&self) -> Option<Variable<B>> {
        self.0.grad.borrow().clone()
    }

    /// The accumulated gradient as a raw tensor.
    pub fn grad_data(&self) -> Option<B::Tensor> {
        self.0.grad.borrow().as_ref().map(|g| g.data().clone())
    }

    /// Drop the accumulated gradient, typically between training steps.
    pub fn cleargrad(&self) {
        self.0.grad.replace(None);
    }

    /// Add `gx` to the gradient slot. A fresh variable is stored each time,
    /// so gradients handed out earlier never change underneath their holder.
    pub(crate) fn accumulate_grad(&self, gx: Variable<B>) {
        let mut slot = self.0.grad.borrow_mut();
        let next = match slot.take() {
            Some(existing) => Variable::new(B::add(existing.data(), gx.data())),
            None => gx,
        };
        *slot = Some(next);
    }

    /// Backpropagate from this variable, seeding its gradient with ones.
    ///
    /// Intermediate gradients are released once consumed; leaf gradients
    /// are kept.
    pub fn backward(&self) -> Result<()> {
        self.backward_with(B::ones(self.shape()), false)
    }

    /// Backpropagate from this variable with an explicit seed gradient.
    ///
    /// The seed is summed into any gradient already present. With
    /// `retain_grad` every visited variable keeps its gradient.
    pub fn backward_with(&self, seed: B::Tensor, retain_grad: bool) -> Result<()> {
        crate::backward::backward(self, seed, retain_grad)
    }
}

/// One application of a [`Function`] in the graph.
pub struct FunctionNode<B: Backend> {
    pub(crate) id: NodeId,
    pub(crate) name: &'static str,
    pub(crate) generation: usize,
    pub(crate) function: Box<dyn Function<B>>,
    pub(crate) inputs: Vec<Variable<B>>,
    pub(crate) outputs: RefCell<Vec<Weak<VariableNode<B>>>>,
    pub(crate) output_shapes: Vec<Shape>,
}

impl<B: Backend> std::fmt::Debug for FunctionNode<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.generation)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.output_shapes)
            .finish()
    }
}

/// Run `function` on `inputs` and record the application in the graph.
///
/// Each output becomes a new variable whose creator is the recorded node.
/// Inside a [`mode::no_grad`] scope nothing is recorded and the outputs are
/// plain leaves.
pub fn apply<B, F>(mut function: F, inputs: &[&Variable<B>]) -> Result<Vec<Variable<B>>>
where
    B: Backend,
    F: Function<B>,
{
    let name = function.name();
    if inputs.len() != function.arity() {
        return Err(AutodiffError::InputCount {
            function: name,
            expected: function.arity(),
            actual: inputs.len(),
        });
    }

    let xs: Vec<&B::Tensor> = inputs.iter().map(|v| v.data()).collect();
    let ys = function.forward(&xs)?;

    if !mode::is_backprop_enabled() {
        return Ok(ys.into_iter().map(Variable::new).collect());
    }

    let generation = inputs.iter().map(|v| v.generation()).max().unwrap_or(0);
    let node = Rc::new(FunctionNode {
        id: next_node_id(),
        name,
        generation,
        function: Box::new(function),
        inputs: inputs.iter().map(|&v| v.clone()).collect(),
        outputs: RefCell::new(Vec::with_capacity(ys.len())),
        output_shapes: ys.iter().map(|y| y.shape().clone()).collect(),
    });

    let outputs: Vec<Variable<B>> = ys
        .into_iter()
        .map(|y| Variable::from_parts(y, None, generation + 1, Some(Rc::clone(&node))))
        .collect();
    *node.outputs.borrow_mut() = outputs.iter().map(|o| Rc::downgrade(&o.0)).collect();

    trace!(function = name, id = node.id.0, generation, backend = B::name(), "apply");
    Ok(outputs)
}

/// [`apply`] for functions with exactly one output.
pub fn apply_single<B, F>(function: F, inputs: &[&Variable<B>]) -> Result<Variable<B>>
where
    B: Backend,
    F: Function<B>,
{
    let name = function.name();
    let mut outputs = apply(function, inputs)?;
    if outputs.len() != 1 {
        return Err(AutodiffError::OutputCount {
            function: name,
            expected: 1,
            actual: outputs.len(),
        });
    }
    Ok(outputs.remove(0))
}
