//! Element-wise clipping.

use ad_tensor::prelude::*;

/// Clamp every element into `[x_min, x_max]`.
///
/// The gradient passes where the *input* lies inside the closed interval
/// and is zero elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct Clip {
    pub x_min: f32,
    pub x_max: f32,
}

impl<B: Backend> Function<B> for Clip {
    fn name(&self) -> &'static str {
        "clip"
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        Ok(vec![B::clip(xs[0], self.x_min, self.x_max)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let x = ctx.input(0).data();
        let mask = B::mul(
            &B::ge(x, &B::scalar(self.x_min)),
            &B::le(x, &B::scalar(self.x_max)),
        );
        Ok(vec![gys[0].mul(&Variable::new(mask))?])
    }
}

/// Clip `x` into `[x_min, x_max]`.
pub fn clip<B: Backend>(x: &Variable<B>, x_min: f32, x_max: f32) -> Result<Variable<B>> {
    apply_single(Clip { x_min, x_max }, &[x])
}
