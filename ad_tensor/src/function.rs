//! The `Function` contract every differentiable operation implements.

use std::rc::Weak;

use crate::backend::Backend;
use crate::error::{AutodiffError, Result};
use crate::node::{Variable, VariableNode};

/// A differentiable operation.
///
/// `forward` runs once, on raw tensors, when the function is applied and
/// may cache whatever `backward` needs. `backward` runs during the reverse
/// walk with one gradient per output and must return one gradient per
/// input, each with that input's shape. Gradients are `Variable`s, so a
/// backward can be written with the graph-aware operations.
pub trait Function<B: Backend>: 'static {
    /// Name used in errors and logs.
    fn name(&self) -> &'static str;

    /// Number of inputs `forward` expects.
    fn arity(&self) -> usize {
        1
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>>;

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>>;
}

/// The recorded inputs and outputs of the node being differentiated.
pub struct Context<'a, B: Backend> {
    pub(crate) function: &'static str,
    pub(crate) inputs: &'a [Variable<B>],
    pub(crate) outputs: &'a [Weak<VariableNode<B>>],
}

impl<'a, B: Backend> Context<'a, B> {
    /// Input `index` as it was passed to `apply`.
    pub fn input(&self, index: usize) -> &Variable<B> {
        &self.inputs[index]
    }

    pub fn inputs(&self) -> &[Variable<B>] {
        self.inputs
    }

    /// Output `index`, if some handle to it is still alive.
    pub fn output(&self, index: usize) -> Result<Variable<B>> {
        self.outputs
            .get(index)
            .and_then(Weak::upgrade)
            .map(Variable)
            .ok_or(AutodiffError::OutputDropped {
                function: self.function,
                index,
            })
    }
}
