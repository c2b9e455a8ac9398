//! Broadcasting element-wise arithmetic.

use crate::backend::Backend;
use crate::error::{AutodiffError, Result};
use crate::function::{Context, Function};
use crate::node::{apply_single, Variable};
use crate::tensor::TensorData;

fn check_broadcast<B: Backend>(function: &'static str, a: &B::Tensor, b: &B::Tensor) -> Result<()> {
    match a.shape().broadcast_with(b.shape()) {
        Some(_) => Ok(()),
        None => Err(AutodiffError::IncompatibleShapes {
            function,
            lhs: a.shape().clone(),
            rhs: b.shape().clone(),
        }),
    }
}

macro_rules! binary_forward {
    ($name:literal, $op:ident) => {
        fn name(&self) -> &'static str {
            $name
        }

        fn arity(&self) -> usize {
            2
        }

        fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
            check_broadcast::<B>($name, xs[0], xs[1])?;
            Ok(vec![B::$op(xs[0], xs[1])])
        }
    };
}

/// `a + b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Add;

impl<B: Backend> Function<B> for Add {
    binary_forward!("add", add);

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let gy = &gys[0];
        Ok(vec![
            gy.sum_to(ctx.input(0).shape())?,
            gy.sum_to(ctx.input(1).shape())?,
        ])
    }
}

/// `a - b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Sub;

impl<B: Backend> Function<B> for Sub {
    binary_forward!("sub", sub);

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let gy = &gys[0];
        Ok(vec![
            gy.sum_to(ctx.input(0).shape())?,
            gy.neg()?.sum_to(ctx.input(1).shape())?,
        ])
    }
}

/// `a * b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Mul;

impl<B: Backend> Function<B> for Mul {
    binary_forward!("mul", mul);

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let (a, b) = (ctx.input(0), ctx.input(1));
        let gy = &gys[0];
        Ok(vec![
            gy.mul(b)?.sum_to(a.shape())?,
            gy.mul(a)?.sum_to(b.shape())?,
        ])
    }
}

/// `a / b`
#[derive(Debug, Clone, Copy, Default)]
pub struct Div;

impl<B: Backend> Function<B> for Div {
    binary_forward!("div", div);

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let (a, b) = (ctx.input(0), ctx.input(1));
        let gy = &gys[0];
        // d(a/b)/db = -a / b^2
        let ga = gy.div(b)?;
        let gb = gy.mul(&a.neg()?.div(&b.mul(b)?)?)?;
        Ok(vec![ga.sum_to(a.shape())?, gb.sum_to(b.shape())?])
    }
}

/// `-x`
#[derive(Debug, Clone, Copy, Default)]
pub struct Neg;

impl<B: Backend> Function<B> for Neg {
    fn name(&self) -> &'static str {
        "neg"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        Ok(vec![B::neg(xs[0])])
    }

    fn backward(&self, _ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        Ok(vec![gys[0].neg()?])
    }
}

impl<B: Backend> Variable<B> {
    pub fn add(&self, other: &Variable<B>) -> Result<Variable<B>> {
        apply_single(Add, &[self, other])
    }

    pub fn sub(&self, other: &Variable<B>) -> Result<Variable<B>> {
        apply_single(Sub, &[self, other])
    }

    pub fn mul(&self, other: &Variable<B>) -> Result<Variable<B>> {
        apply_single(Mul, &[self, other])
    }

    pub fn div(&self, other: &Variable<B>) -> Result<Variable<B>> {
        apply_single(Div, &[self, other])
    }

    pub fn neg(&self) -> Result<Variable<B>> {
        apply_single(Neg, &[self])
    }
}
