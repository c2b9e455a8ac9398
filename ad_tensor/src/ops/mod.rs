//! Graph-aware basic functions.
//!
//! Each operation is a [`Function`](crate::Function) type plus a method on
//! [`Variable`](crate::Variable), so backward passes of other functions can
//! be written with them and stay differentiable.

pub mod arith;
pub mod shape;

pub use arith::{Add, Div, Mul, Neg, Sub};
pub use shape::{BroadcastTo, Reshape, Sum, SumTo, Transpose};

use crate::error::{AutodiffError, Result};

/// Check that every axis is below `ndim` and appears once.
pub fn check_axes(function: &'static str, axes: &[usize], ndim: usize) -> Result<()> {
    let mut seen = vec![false; ndim];
    for &ax in axes {
        if ax >= ndim || seen[ax] {
            return Err(AutodiffError::InvalidAxes {
                function,
                axes: axes.to_vec(),
                ndim,
            });
        }
        seen[ax] = true;
    }
    Ok(())
}
