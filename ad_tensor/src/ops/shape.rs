//! Reshape, transpose, broadcast and reductions back to a shape.

use crate::backend::Backend;
use crate::error::{AutodiffError, Result};
use crate::function::{Context, Function};
use crate::node::{apply_single, Variable};
use crate::ops::check_axes;
use crate::shape::Shape;
use crate::tensor::TensorData;

/// Reinterpret the data with a new shape of equal size.
#[derive(Debug, Clone)]
pub struct Reshape {
    pub shape: Shape,
}

impl<B: Backend> Function<B> for Reshape {
    fn name(&self) -> &'static str {
        "reshape"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        if xs[0].numel() != self.shape.numel() {
            return Err(AutodiffError::IncompatibleShapes {
                function: "reshape",
                lhs: xs[0].shape().clone(),
                rhs: self.shape.clone(),
            });
        }
        Ok(vec![B::reshape(xs[0], &self.shape)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        Ok(vec![gys[0].reshape(ctx.input(0).shape())?])
    }
}

/// Permute axes; `None` reverses them.
#[derive(Debug, Clone, Default)]
pub struct Transpose {
    pub axes: Option<Vec<usize>>,
}

impl<B: Backend> Function<B> for Transpose {
    fn name(&self) -> &'static str {
        "transpose"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        if let Some(axes) = &self.axes {
            let ndim = xs[0].ndim();
            if axes.len() != ndim {
                return Err(AutodiffError::InvalidAxes {
                    function: "transpose",
                    axes: axes.clone(),
                    ndim,
                });
            }
            check_axes("transpose", axes, ndim)?;
        }
        Ok(vec![B::transpose(xs[0], self.axes.as_deref())])
    }

    fn backward(&self, _ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let inverse = self.axes.as_ref().map(|axes| {
            let mut inv = vec![0; axes.len()];
            for (i, &ax) in axes.iter().enumerate() {
                inv[ax] = i;
            }
            inv
        });
        Ok(vec![gys[0].transpose(inverse.as_deref())?])
    }
}

/// Broadcast to a larger shape.
#[derive(Debug, Clone)]
pub struct BroadcastTo {
    pub shape: Shape,
}

impl<B: Backend> Function<B> for BroadcastTo {
    fn name(&self) -> &'static str {
        "broadcast_to"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        if xs[0].shape().broadcast_with(&self.shape).as_ref() != Some(&self.shape) {
            return Err(AutodiffError::IncompatibleShapes {
                function: "broadcast_to",
                lhs: xs[0].shape().clone(),
                rhs: self.shape.clone(),
            });
        }
        Ok(vec![B::broadcast_to(xs[0], &self.shape)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        Ok(vec![gys[0].sum_to(ctx.input(0).shape())?])
    }
}

/// Sum broadcast axes away until the result has `shape`.
#[derive(Debug, Clone)]
pub struct SumTo {
    pub shape: Shape,
}

impl<B: Backend> Function<B> for SumTo {
    fn name(&self) -> &'static str {
        "sum_to"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        let x_shape = xs[0].shape();
        if self.shape.broadcast_with(x_shape).as_ref() != Some(x_shape) {
            return Err(AutodiffError::IncompatibleShapes {
                function: "sum_to",
                lhs: x_shape.clone(),
                rhs: self.shape.clone(),
            });
        }
        Ok(vec![B::sum_to(xs[0], &self.shape)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        Ok(vec![gys[0].broadcast_to(ctx.input(0).shape())?])
    }
}

/// Sum over `axes` (`None` = all).
#[derive(Debug, Clone, Default)]
pub struct Sum {
    pub axes: Option<Vec<usize>>,
    pub keepdims: bool,
}

impl<B: Backend> Function<B> for Sum {
    fn name(&self) -> &'static str {
        "sum"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        if let Some(axes) = &self.axes {
            check_axes("sum", axes, xs[0].ndim())?;
        }
        Ok(vec![B::sum(xs[0], self.axes.as_deref(), self.keepdims)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let x_shape = ctx.input(0).shape();
        let kept = x_shape.keepdims(self.axes.as_deref());
        Ok(vec![gys[0].reshape(&kept)?.broadcast_to(x_shape)?])
    }
}

impl<B: Backend> Variable<B> {
    pub fn reshape(&self, shape: &Shape) -> Result<Variable<B>> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        apply_single(Reshape { shape: shape.clone() }, &[self])
    }

    pub fn transpose(&self, axes: Option<&[usize]>) -> Result<Variable<B>> {
        apply_single(
            Transpose {
                axes: axes.map(<[usize]>::to_vec),
            },
            &[self],
        )
    }

    pub fn broadcast_to(&self, shape: &Shape) -> Result<Variable<B>> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        apply_single(BroadcastTo { shape: shape.clone() }, &[self])
    }

    pub fn sum_to(&self, shape: &Shape) -> Result<Variable<B>> {
        if self.shape() == shape {
            return Ok(self.clone());
        }
        apply_single(SumTo { shape: shape.clone() }, &[self])
    }

    pub fn sum(&self, axes: Option<&[usize]>, keepdims: bool) -> Result<Variable<B>> {
        apply_single(
            Sum {
                axes: axes.map(<[usize]>::to_vec),
                keepdims,
            },
            &[self],
        )
    }
}
