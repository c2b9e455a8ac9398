//! # ad_tensor - Define-by-Run Autodiff with Pluggable Backends
//!
//! This crate provides a define-by-run reverse-mode automatic differentiation
//! engine. Every operation applied to a [`Variable`] runs immediately and
//! records a node in the computation graph, which [`Variable::backward`]
//! later walks in reverse.
//!
//! ## Overview
//!
//! The core abstractions are:
//! - [`Shape`] and [`Strides`] - Tensor shape and memory layout
//! - [`TensorData`] - Trait for tensor storage
//! - [`Backend`] - Trait for compute backends implementing tensor operations
//! - [`Variable`] - Reference-counted value with a gradient slot and a creator
//! - [`Function`] - Trait every differentiable operation implements
//! - [`mode`] - Thread-local train/inference mode and `no_grad` scopes
//!
//! ## Example
//!
//! ```ignore
//! use ad_tensor::prelude::*;
//! use ad_backend_cpu::{variable, CpuBackend};
//!
//! let x = variable(vec![1.0, 2.0, 3.0], &[3]);
//! let y = variable(vec![4.0, 5.0, 6.0], &[3]);
//!
//! // z = sum(x * y + x)
//! let z = x.mul(&y)?.add(&x)?.sum(None, false)?;
//! z.backward()?;
//! let dx = x.grad_data().unwrap();
//! ```

pub mod backend;
mod backward;
pub mod error;
pub mod function;
pub mod mode;
pub mod node;
pub mod ops;
pub mod shape;
pub mod tensor;

pub use backend::Backend;
pub use error::{AutodiffError, Result};
pub use function::{Context, Function};
pub use mode::Mode;
pub use node::{apply, apply_single, FunctionNode, NodeId, Variable};
pub use shape::{Shape, Strides};
pub use tensor::TensorData;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::backend::Backend;
    pub use crate::error::{AutodiffError, Result};
    pub use crate::function::{Context, Function};
    pub use crate::mode::{self, Mode};
    pub use crate::node::{apply, apply_single, NodeId, Variable};
    pub use crate::shape::{Shape, Strides};
    pub use crate::tensor::TensorData;
}
