//! Error type for graph construction and the backward pass.

use thiserror::Error;

use crate::shape::Shape;

/// Contract violations detected while building or replaying the graph.
///
/// These are programmer errors: the graph is never repaired, and the
/// offending call returns immediately.
#[derive(Debug, Error)]
pub enum AutodiffError {
    /// A function was applied to the wrong number of inputs.
    #[error("{function}: expected {expected} inputs, got {actual}")]
    InputCount {
        function: &'static str,
        expected: usize,
        actual: usize,
    },

    /// An input tensor has a rank the function does not accept.
    #[error("{function}: expected input of rank {expected}, got rank {actual}")]
    RankMismatch {
        function: &'static str,
        expected: &'static str,
        actual: usize,
    },

    /// Two inputs disagree on a dimension the function requires to match.
    #[error("{function}: incompatible shapes {lhs} and {rhs}")]
    IncompatibleShapes {
        function: &'static str,
        lhs: Shape,
        rhs: Shape,
    },

    /// An axis list does not fit the input's rank.
    #[error("{function}: invalid axes {axes:?} for input of rank {ndim}")]
    InvalidAxes {
        function: &'static str,
        axes: Vec<usize>,
        ndim: usize,
    },

    /// A function produced a different number of outputs than the caller expects.
    #[error("{function}: expected {expected} outputs, got {actual}")]
    OutputCount {
        function: &'static str,
        expected: usize,
        actual: usize,
    },

    /// `backward` produced a different number of gradients than inputs.
    #[error("{function}: backward returned {actual} gradients for {expected} inputs")]
    GradientCount {
        function: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A gradient does not match the shape of the input it belongs to.
    #[error("{function}: gradient for input {index} has shape {actual}, expected {expected}")]
    GradientShape {
        function: &'static str,
        index: usize,
        expected: Shape,
        actual: Shape,
    },

    /// The seed gradient handed to `backward_with` has the wrong shape.
    #[error("seed gradient has shape {actual}, expected {expected}")]
    SeedShape { expected: Shape, actual: Shape },

    /// `backward` ran without the state its paired `forward` caches.
    #[error("{function}: backward called without a matching training forward pass")]
    MissingForwardState { function: &'static str },

    /// A function output needed by `backward` has already been dropped.
    #[error("{function}: output {index} was dropped before backward")]
    OutputDropped { function: &'static str, index: usize },
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, AutodiffError>;
