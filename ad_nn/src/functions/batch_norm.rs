//! Batch normalization over the channel axis.
//!
//! Inputs are `[N, C]` or `[N, C, H, W]`. Rank-4 inputs are moved to
//! channel-last and flattened to `[N*H*W, C]` so both cases normalize the
//! columns of a matrix; the output is restored to the input layout.

use std::cell::RefCell;
use std::rc::Rc;

use ad_tensor::mode;
use ad_tensor::prelude::*;
use tracing::trace;

/// Hyperparameters of batch normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    /// Weight of the old running value in the moving average.
    pub decay: f32,
    /// Added to the variance before the square root.
    pub eps: f32,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            decay: 0.9,
            eps: 2e-5,
        }
    }
}

struct Moments<B: Backend> {
    mean: B::Tensor,
    var: B::Tensor,
}

/// Per-channel running mean and variance.
///
/// Clones share the same storage, so a caller can keep one handle and give
/// another to each training-mode application.
pub struct RunningStats<B: Backend>(Rc<RefCell<Moments<B>>>);

impl<B: Backend> Clone for RunningStats<B> {
    fn clone(&self) -> Self {
        RunningStats(Rc::clone(&self.0))
    }
}

impl<B: Backend> RunningStats<B> {
    /// Mean 0 and variance 1 for each of `channels`.
    pub fn new(channels: usize) -> Self {
        let shape = Shape::new(vec![channels]);
        Self::from_tensors(B::zeros(&shape), B::ones(&shape))
    }

    pub fn from_tensors(mean: B::Tensor, var: B::Tensor) -> Self {
        RunningStats(Rc::new(RefCell::new(Moments { mean, var })))
    }

    pub fn mean(&self) -> B::Tensor {
        self.0.borrow().mean.clone()
    }

    pub fn var(&self) -> B::Tensor {
        self.0.borrow().var.clone()
    }

    pub fn channels(&self) -> usize {
        self.0.borrow().mean.numel()
    }

    /// Blend a batch's statistics into the running averages.
    ///
    /// `adjust` turns the batch's population variance into an unbiased
    /// estimate before it is blended in.
    fn update(&self, mean: &B::Tensor, var: &B::Tensor, decay: f32, adjust: f32) {
        let keep = B::scalar(decay);
        let take = B::scalar(1.0 - decay);
        let unbiased = B::mul(var, &B::scalar(adjust));

        let mut stats = self.0.borrow_mut();
        stats.mean = B::add(&B::mul(&stats.mean, &keep), &B::mul(mean, &take));
        stats.var = B::add(&B::mul(&stats.var, &keep), &B::mul(&unbiased, &take));
        trace!(decay, adjust, channels = stats.mean.numel(), "running statistics updated");
    }
}

/// Where the channel axis sits and how to get back to it.
#[derive(Debug, Clone, Copy)]
enum Layout {
    Matrix,
    Nchw { n: usize, c: usize, h: usize, w: usize },
}

impl Layout {
    fn of(function: &'static str, shape: &Shape) -> Result<Layout> {
        match *shape.dims() {
            [_, _] => Ok(Layout::Matrix),
            [n, c, h, w] => Ok(Layout::Nchw { n, c, h, w }),
            _ => Err(AutodiffError::RankMismatch {
                function,
                expected: "2 or 4",
                actual: shape.ndim(),
            }),
        }
    }

    fn to_matrix<B: Backend>(self, x: &B::Tensor) -> B::Tensor {
        match self {
            Layout::Matrix => x.clone(),
            Layout::Nchw { n, c, h, w } => {
                let nhwc = B::transpose(x, Some(&[0, 2, 3, 1]));
                B::reshape(&nhwc, &Shape::new(vec![n * h * w, c]))
            }
        }
    }

    fn from_matrix<B: Backend>(self, x: &B::Tensor) -> B::Tensor {
        match self {
            Layout::Matrix => x.clone(),
            Layout::Nchw { n, c, h, w } => {
                let nhwc = B::reshape(x, &Shape::new(vec![n, h, w, c]));
                B::transpose(&nhwc, Some(&[0, 3, 1, 2]))
            }
        }
    }

    fn var_to_matrix<B: Backend>(self, x: &Variable<B>) -> Result<Variable<B>> {
        match self {
            Layout::Matrix => Ok(x.clone()),
            Layout::Nchw { n, c, h, w } => x
                .transpose(Some(&[0, 2, 3, 1]))?
                .reshape(&Shape::new(vec![n * h * w, c])),
        }
    }

    fn var_from_matrix<B: Backend>(self, x: &Variable<B>) -> Result<Variable<B>> {
        match self {
            Layout::Matrix => Ok(x.clone()),
            Layout::Nchw { n, c, h, w } => x
                .reshape(&Shape::new(vec![n, h, w, c]))?
                .transpose(Some(&[0, 3, 1, 2])),
        }
    }
}

/// Batch normalization as a graph function with inputs `(x, gamma, beta)`.
///
/// In training mode the batch statistics normalize `x` and are folded into
/// the shared [`RunningStats`]; in inference mode the running statistics
/// are used and left untouched. Only a training-mode forward caches what
/// `backward` needs.
pub struct BatchNormFn<B: Backend> {
    stats: RunningStats<B>,
    config: BatchNormConfig,
    mode: Option<Mode>,
    inv_std: Option<B::Tensor>,
}

impl<B: Backend> std::fmt::Debug for BatchNormFn<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchNormFn")
            .field("channels", &self.stats.channels())
            .field("config", &self.config)
            .field("mode", &self.mode)
            .field("cached", &self.inv_std.is_some())
            .finish()
    }
}

impl<B: Backend> BatchNormFn<B> {
    /// Follow the thread's current mode at forward time.
    pub fn new(stats: RunningStats<B>, config: BatchNormConfig) -> Self {
        BatchNormFn {
            stats,
            config,
            mode: None,
            inv_std: None,
        }
    }

    /// Always run in `mode`, whatever the thread's current mode.
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    fn check_params(&self, x: &B::Tensor, gamma: &B::Tensor, beta: &B::Tensor) -> Result<()> {
        for p in [gamma, beta] {
            if p.ndim() != 1 {
                return Err(AutodiffError::RankMismatch {
                    function: "batch_norm",
                    expected: "1",
                    actual: p.ndim(),
                });
            }
        }
        let channels = x.shape().dim(1);
        for p in [gamma, beta, &self.stats.mean(), &self.stats.var()] {
            if p.numel() != channels {
                return Err(AutodiffError::IncompatibleShapes {
                    function: "batch_norm",
                    lhs: x.shape().clone(),
                    rhs: p.shape().clone(),
                });
            }
        }
        Ok(())
    }
}

fn inverse_std<B: Backend>(var: &B::Tensor, eps: f32) -> B::Tensor {
    let std = B::sqrt(&B::add(var, &B::scalar(eps)));
    B::div(&B::ones(std.shape()), &std)
}

impl<B: Backend> Function<B> for BatchNormFn<B> {
    fn name(&self) -> &'static str {
        "batch_norm"
    }

    fn arity(&self) -> usize {
        3
    }

    fn forward(&mut self, xs: &[&B::Tensor]) -> Result<Vec<B::Tensor>> {
        let (x, gamma, beta) = (xs[0], xs[1], xs[2]);
        let layout = Layout::of("batch_norm", x.shape())?;
        self.check_params(x, gamma, beta)?;

        let x = layout.to_matrix::<B>(x);
        let mode = self.mode.unwrap_or_else(mode::current);

        let xc = if mode.is_train() {
            let mean = B::mean(&x, Some(&[0]), false);
            let var = B::var(&x, Some(&[0]), false);
            let inv_std = inverse_std::<B>(&var, self.config.eps);
            let xc = B::mul(&B::sub(&x, &mean), &inv_std);

            let m = x.numel() / gamma.numel();
            let adjust = m as f32 / m.saturating_sub(1).max(1) as f32;
            self.stats.update(&mean, &var, self.config.decay, adjust);
            self.inv_std = Some(inv_std);
            xc
        } else {
            let inv_std = inverse_std::<B>(&self.stats.var(), self.config.eps);
            B::mul(&B::sub(&x, &self.stats.mean()), &inv_std)
        };

        let y = B::add(&B::mul(gamma, &xc), beta);
        Ok(vec![layout.from_matrix::<B>(&y)])
    }

    fn backward(&self, ctx: &Context<'_, B>, gys: &[Variable<B>]) -> Result<Vec<Variable<B>>> {
        let inv_std = self
            .inv_std
            .as_ref()
            .ok_or(AutodiffError::MissingForwardState {
                function: "batch_norm",
            })?;
        let inv_std = Variable::new(inv_std.clone());
        let (x, gamma) = (ctx.input(0), ctx.input(1));

        let layout = Layout::of("batch_norm", gys[0].shape())?;
        let gy = layout.var_to_matrix(&gys[0])?;
        let x = layout.var_to_matrix(x)?;
        let batch = Variable::scalar(gy.shape().dim(0) as f32);

        let mean = x.sum(Some(&[0]), false)?.div(&batch)?;
        let xc = x.sub(&mean)?.mul(&inv_std)?;
        let gbeta = gy.sum(Some(&[0]), false)?;
        let ggamma = xc.mul(&gy)?.sum(Some(&[0]), false)?;

        let gx = gy
            .sub(&gbeta.div(&batch)?)?
            .sub(&xc.mul(&ggamma)?.div(&batch)?)?
            .mul(gamma)?
            .mul(&inv_std)?;

        Ok(vec![layout.var_from_matrix(&gx)?, ggamma, gbeta])
    }
}

/// Batch-normalize `x` with scale `gamma` and shift `beta`, using and
/// updating `stats` according to the thread's current [`Mode`].
pub fn batch_norm<B: Backend>(
    x: &Variable<B>,
    gamma: &Variable<B>,
    beta: &Variable<B>,
    stats: &RunningStats<B>,
    config: BatchNormConfig,
) -> Result<Variable<B>> {
    apply_single(BatchNormFn::new(stats.clone(), config), &[x, gamma, beta])
}

/// [`batch_norm`] with an explicit mode.
pub fn batch_norm_in<B: Backend>(
    x: &Variable<B>,
    gamma: &Variable<B>,
    beta: &Variable<B>,
    stats: &RunningStats<B>,
    config: BatchNormConfig,
    mode: Mode,
) -> Result<Variable<B>> {
    apply_single(
        BatchNormFn::new(stats.clone(), config).with_mode(mode),
        &[x, gamma, beta],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_backend_cpu::{finite_diff_grad, variable, CpuBackend};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    type CpuStats = RunningStats<CpuBackend>;

    fn no_decay() -> BatchNormConfig {
        BatchNormConfig { decay: 0.0, eps: 0.0 }
    }

    fn params(c: usize) -> (Variable<CpuBackend>, Variable<CpuBackend>) {
        (variable(vec![1.0; c], &[c]), variable(vec![0.0; c], &[c]))
    }

    #[test]
    fn test_default_config() {
        let config = BatchNormConfig::default();
        assert_eq!(config.decay, 0.9);
        assert_eq!(config.eps, 2e-5);
    }

    #[test]
    fn test_training_normalizes_columns() -> Result<()> {
        let x = variable(vec![1.0, 10.0, 3.0, 20.0, 5.0, 30.0], &[3, 2]);
        let (gamma, beta) = params(2);
        let stats = CpuStats::new(2);

        let y = batch_norm_in(&x, &gamma, &beta, &stats, BatchNormConfig::default(), Mode::Train)?;
        let y = y.as_slice().to_vec();
        for c in 0..2 {
            let col: Vec<f32> = (0..3).map(|r| y[r * 2 + c]).collect();
            let mean: f32 = col.iter().sum::<f32>() / 3.0;
            let var: f32 = col.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 3.0;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
            assert_relative_eq!(var, 1.0, epsilon = 1e-3);
        }
        Ok(())
    }

    #[test]
    fn test_zero_decay_copies_batch_statistics() -> Result<()> {
        let x = variable(vec![1.0, 10.0, 3.0, 20.0, 5.0, 30.0, 7.0, 40.0], &[4, 2]);
        let (gamma, beta) = params(2);
        let stats = CpuStats::new(2);

        batch_norm_in(&x, &gamma, &beta, &stats, no_decay(), Mode::Train)?;

        assert_eq!(stats.mean().as_slice(), &[4.0, 25.0]);
        // Population variances 5 and 125, scaled by 4/3.
        let var = stats.var();
        assert_relative_eq!(var.as_slice()[0], 5.0 * 4.0 / 3.0, max_relative = 1e-6);
        assert_relative_eq!(var.as_slice()[1], 125.0 * 4.0 / 3.0, max_relative = 1e-6);
        Ok(())
    }

    #[test]
    fn test_running_average_blends_with_decay() -> Result<()> {
        let x = variable(vec![2.0, 4.0], &[2, 1]);
        let (gamma, beta) = params(1);
        let stats = CpuStats::new(1);
        let config = BatchNormConfig { decay: 0.5, eps: 1e-5 };

        batch_norm_in(&x, &gamma, &beta, &stats, config, Mode::Train)?;
        // mean 3, unbiased var 2
        assert_relative_eq!(stats.mean().as_slice()[0], 1.5);
        assert_relative_eq!(stats.var().as_slice()[0], 0.5 + 1.0);
        Ok(())
    }

    #[test]
    fn test_single_sample_batch_clamps_divisor() -> Result<()> {
        let x = variable(vec![3.0, -1.0], &[1, 2]);
        let (gamma, beta) = params(2);
        let stats = CpuStats::new(2);

        let config = BatchNormConfig { decay: 0.0, eps: 1e-5 };

        let y = batch_norm_in(&x, &gamma, &beta, &stats, config, Mode::Train)?;
        assert_eq!(stats.mean().as_slice(), &[3.0, -1.0]);
        assert_eq!(stats.var().as_slice(), &[0.0, 0.0]);
        assert_eq!(y.as_slice(), &[0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_inference_with_unit_stats_is_affine() -> Result<()> {
        let x = variable(vec![1.0, -2.0, 0.5, 4.0], &[2, 2]);
        let gamma = variable(vec![2.0, 3.0], &[2]);
        let beta = variable(vec![0.5, -1.0], &[2]);
        let stats = CpuStats::new(2);
        let config = BatchNormConfig { decay: 0.9, eps: 0.0 };

        let y = {
            let _eval = mode::test_mode();
            batch_norm(&x, &gamma, &beta, &stats, config)?
        };
        assert_eq!(y.as_slice(), &[2.5, -7.0, 1.5, 11.0]);
        assert_eq!(stats.mean().as_slice(), &[0.0, 0.0]);
        assert_eq!(stats.var().as_slice(), &[1.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_inference_uses_running_statistics() -> Result<()> {
        let x = variable(vec![3.0, 7.0], &[2, 1]);
        let (gamma, beta) = params(1);
        let stats = CpuStats::from_tensors(
            CpuBackend::from_vec(vec![1.0], Shape::new(vec![1])),
            CpuBackend::from_vec(vec![4.0], Shape::new(vec![1])),
        );
        let config = BatchNormConfig { decay: 0.9, eps: 0.0 };

        let y = batch_norm_in(&x, &gamma, &beta, &stats, config, Mode::Inference)?;
        assert_eq!(y.as_slice(), &[1.0, 3.0]);
        Ok(())
    }

    #[test]
    fn test_rank_three_is_rejected() {
        let x = variable(vec![0.0; 8], &[2, 2, 2]);
        let (gamma, beta) = params(2);
        let err = batch_norm(&x, &gamma, &beta, &CpuStats::new(2), BatchNormConfig::default())
            .unwrap_err();
        assert!(matches!(
            err,
            AutodiffError::RankMismatch { function: "batch_norm", actual: 3, .. }
        ));
    }

    #[test]
    fn test_channel_mismatch_is_rejected() {
        let x = variable(vec![0.0; 6], &[2, 3]);
        let (gamma, beta) = params(2);
        assert!(matches!(
            batch_norm(&x, &gamma, &beta, &CpuStats::new(3), BatchNormConfig::default()),
            Err(AutodiffError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn test_running_stats_channel_mismatch_is_rejected() {
        let x = variable(vec![0.0; 4], &[2, 2]);
        let (gamma, beta) = params(2);
        let stats = CpuStats::from_tensors(
            CpuBackend::zeros(&Shape::new(vec![2])),
            CpuBackend::ones(&Shape::new(vec![3])),
        );
        for mode in [Mode::Train, Mode::Inference] {
            let result = batch_norm_in(&x, &gamma, &beta, &stats, BatchNormConfig::default(), mode);
            match result {
                Err(AutodiffError::IncompatibleShapes { function, rhs, .. }) => {
                    assert_eq!(function, "batch_norm");
                    assert_eq!(rhs, Shape::new(vec![3]));
                }
                other => panic!("expected IncompatibleShapes, got {:?}", other),
            }
        }
        assert_eq!(stats.mean().as_slice(), &[0.0, 0.0]);
    }

    #[test]
    fn test_debug_reports_cached_state() -> Result<()> {
        let x = variable(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let (gamma, beta) = params(2);
        let mut function = BatchNormFn::new(CpuStats::new(2), BatchNormConfig::default())
            .with_mode(Mode::Train);
        assert!(format!("{:?}", function).contains("cached: false"));

        Function::<CpuBackend>::forward(&mut function, &[x.data(), gamma.data(), beta.data()])?;
        let debug = format!("{:?}", function);
        assert!(debug.contains("channels: 2"), "{}", debug);
        assert!(debug.contains("cached: true"), "{}", debug);
        Ok(())
    }

    #[test]
    fn test_backward_after_inference_forward_fails() -> Result<()> {
        let x = variable(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let (gamma, beta) = params(2);
        let y = batch_norm_in(
            &x,
            &gamma,
            &beta,
            &CpuStats::new(2),
            BatchNormConfig::default(),
            Mode::Inference,
        )?;
        assert!(matches!(
            y.backward(),
            Err(AutodiffError::MissingForwardState { function: "batch_norm" })
        ));
        Ok(())
    }

    #[test]
    fn test_rank_four_matches_channel_matrix() -> Result<()> {
        // N=2, C=2, H=1, W=2
        let data = vec![1.0, 2.0, 10.0, 20.0, 3.0, 4.0, 30.0, 40.0];
        let x = variable(data, &[2, 2, 1, 2]);
        let (gamma, beta) = params(2);
        let stats = CpuStats::new(2);

        let y = batch_norm_in(&x, &gamma, &beta, &stats, no_decay(), Mode::Train)?;
        assert_eq!(y.shape().dims(), &[2, 2, 1, 2]);
        assert_eq!(stats.mean().as_slice(), &[2.5, 25.0]);

        // Channel 0 holds 1, 2, 3, 4 in batch order.
        let y = y.as_slice().to_vec();
        let channel0 = [y[0], y[1], y[4], y[5]];
        assert!(channel0.windows(2).all(|w| w[0] < w[1]));
        assert_relative_eq!(channel0.iter().sum::<f32>(), 0.0, epsilon = 1e-5);
        Ok(())
    }

    fn check_gradients(dims: &[usize], seed: u64) -> Result<()> {
        let c = dims[1];
        let numel: usize = dims.iter().product();
        let mut rng = StdRng::seed_from_u64(seed);
        // Well-spread inputs keep every channel's variance away from zero.
        let x_data: Vec<f32> = (0..numel)
            .map(|i| ((i * 7) % numel) as f32 * 0.5 - numel as f32 * 0.25 + rng.gen_range(-0.1..0.1))
            .collect();
        let g_data: Vec<f32> = (0..c).map(|_| rng.gen_range(0.5..1.5)).collect();
        let b_data: Vec<f32> = (0..c).map(|_| rng.gen_range(-0.5..0.5)).collect();
        let w_data: Vec<f32> = (0..numel).map(|_| rng.gen_range(-1.0..1.0)).collect();

        let config = BatchNormConfig { decay: 0.9, eps: 1e-3 };
        let shape = Shape::from(dims);
        let loss = |v: &[Variable<CpuBackend>]| -> Result<Variable<CpuBackend>> {
            let weights = Variable::new(CpuBackend::from_vec(w_data.clone(), shape.clone()));
            let stats = CpuStats::new(c);
            batch_norm_in(&v[0], &v[1], &v[2], &stats, config, Mode::Train)?.mul(&weights)
        };

        let x = variable(x_data.clone(), dims);
        let gamma = variable(g_data.clone(), &[c]);
        let beta = variable(b_data.clone(), &[c]);
        loss(&[x.clone(), gamma.clone(), beta.clone()])?
            .sum(None, false)?
            .backward()?;

        let fd = finite_diff_grad(
            loss,
            &[x_data, g_data, b_data],
            &[shape.clone(), Shape::new(vec![c]), Shape::new(vec![c])],
            1e-2,
        )?;

        for (var, expected) in [&x, &gamma, &beta].into_iter().zip(&fd) {
            let grad = var.grad_data().expect("gradient present");
            assert_eq!(grad.shape(), var.shape());
            for (a, b) in grad.as_slice().iter().zip(expected) {
                assert!((a - b).abs() < 2e-2, "analytic {} vs numeric {}", a, b);
            }
        }
        Ok(())
    }

    #[test]
    fn test_matrix_gradients_match_finite_difference() -> Result<()> {
        check_gradients(&[5, 3], 0)
    }

    #[test]
    fn test_nchw_gradients_match_finite_difference() -> Result<()> {
        check_gradients(&[2, 2, 2, 2], 1)
    }
}
