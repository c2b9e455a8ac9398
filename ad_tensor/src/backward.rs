//! Reverse-mode traversal of the recorded graph.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::rc::Rc;

use tracing::{debug, trace_span};

use crate::backend::Backend;
use crate::error::{AutodiffError, Result};
use crate::function::Context;
use crate::mode;
use crate::node::{FunctionNode, NodeId, Variable};
use crate::tensor::TensorData;

/// Heap entry: deeper generations first, later-created nodes on ties.
struct Pending<B: Backend>(Rc<FunctionNode<B>>);

impl<B: Backend> Pending<B> {
    fn key(&self) -> (usize, NodeId) {
        (self.0.generation, self.0.id)
    }
}

impl<B: Backend> PartialEq for Pending<B> {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl<B: Backend> Eq for Pending<B> {}

impl<B: Backend> PartialOrd for Pending<B> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<B: Backend> Ord for Pending<B> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub(crate) fn backward<B: Backend>(
    output: &Variable<B>,
    seed: B::Tensor,
    retain_grad: bool,
) -> Result<()> {
    if seed.shape() != output.shape() {
        return Err(AutodiffError::SeedShape {
            expected: output.shape().clone(),
            actual: seed.shape().clone(),
        });
    }

    let _no_grad = mode::no_grad();
    output.accumulate_grad(Variable::new(seed));

    let mut queue = BinaryHeap::new();
    let mut seen = HashSet::new();
    if let Some(creator) = output.creator() {
        seen.insert(creator.id);
        queue.push(Pending(Rc::clone(creator)));
    }

    let mut visited = 0usize;
    while let Some(Pending(node)) = queue.pop() {
        let _span = trace_span!("backward", function = node.name, generation = node.generation)
            .entered();
        visited += 1;

        let outputs: Vec<Option<Variable<B>>> = node
            .outputs
            .borrow()
            .iter()
            .map(|w| w.upgrade().map(Variable))
            .collect();
        let gys: Vec<Variable<B>> = outputs
            .iter()
            .zip(&node.output_shapes)
            .map(|(out, shape)| {
                out.as_ref()
                    .and_then(Variable::grad)
                    .unwrap_or_else(|| Variable::new(B::zeros(shape)))
            })
            .collect();

        let gxs = {
            let weak_outputs = node.outputs.borrow();
            let ctx = Context {
                function: node.name,
                inputs: &node.inputs,
                outputs: &weak_outputs,
            };
            node.function.backward(&ctx, &gys)?
        };

        if gxs.len() != node.inputs.len() {
            return Err(AutodiffError::GradientCount {
                function: node.name,
                expected: node.inputs.len(),
                actual: gxs.len(),
            });
        }
        for (index, (x, gx)) in node.inputs.iter().zip(&gxs).enumerate() {
            if gx.shape() != x.shape() {
                return Err(AutodiffError::GradientShape {
                    function: node.name,
                    index,
                    expected: x.shape().clone(),
                    actual: gx.shape().clone(),
                });
            }
        }

        for (x, gx) in node.inputs.iter().zip(gxs) {
            x.accumulate_grad(gx);
            if let Some(creator) = x.creator() {
                if seen.insert(creator.id) {
                    queue.push(Pending(Rc::clone(creator)));
                }
            }
        }

        if !retain_grad {
            for out in outputs.iter().flatten() {
                out.cleargrad();
            }
        }
    }

    debug!(functions = visited, retain_grad, backend = B::name(), "backward complete");
    Ok(())
}
