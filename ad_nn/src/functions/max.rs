//! Max and min reductions.

use ad_tensor::ops::check_axes;
use ad_tensor::prelude::*;

/// Maximum over `axes` (`None` = all).
///
/// The gradient flows to every position equal to the maximum of its slice;
/// tied positions each receive the full upstream gradient.
#[derive(Debug, Clone, Default)]
pub struct Max {
    pub axes: Option<Vec<usize>>,
    pub keepdims: bool,
}

impl Max {
    pub fn new(axes: Option<&[usize]>, keepdims: bool) -> Self {
        Max {
            axes: axes.map(<[usize]>::to_vec),
            keepdims,
        }
    }

    fn check(&self, function: &'static str, x: &impl TensorData) -> Result<()> {
        match &self.axes {
            Some(axes) => check_axes(function, axes, x.ndim()),
            None => Ok(()),
        }
    }
}

impl<B: Backend> Function<B> for Max {
    fn name(&self) -> &'static str {
        "max"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        self.check("max", xs[0])?;
        Ok(vec![B::max(xs[0], self.axes.as_deref(), self.keepdims)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let x = ctx.input(0);
        let kept = x.shape().keepdims(self.axes.as_deref());

        let gy = gys[0].reshape(&kept)?;
        let y = ctx.output(0)?.reshape(&kept)?;
        let cond = Variable::new(B::eq(x.data(), y.data()));

        Ok(vec![gy.broadcast_to(x.shape())?.mul(&cond)?])
    }
}

/// Minimum over `axes`. Shares the backward rule of [`Max`].
#[derive(Debug, Clone, Default)]
pub struct Min(pub Max);

impl<B: Backend> Function<B> for Min {
    fn name(&self) -> &'static str {
        "min"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        self.0.check("min", xs[0])?;
        Ok(vec![B::min(xs[0], self.0.axes.as_deref(), self.0.keepdims)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        Function::<B>::backward(&self.0, ctx, gys)
    }
}

/// Maximum of `x` over `axes`.
pub fn max<B: Backend>(
    x: &Variable<B>,
    axes: Option<&[usize]>,
    keepdims: bool,
) -> Result<Variable<B>> {
    apply_single(Max::new(axes, keepdims), &[x])
}

/// Minimum of `x` over `axes`.
pub fn min<B: Backend>(
    x: &Variable<B>,
    axes: Option<&[usize]>,
    keepdims: bool,
) -> Result<Variable<B>> {
    apply_single(Min(Max::new(axes, keepdims)), &[x])
}
