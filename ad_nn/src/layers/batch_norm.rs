//! Batch normalization layer.

use ad_tensor::mode;
use ad_tensor::prelude::*;
use tracing::debug;

use crate::functions::batch_norm::{batch_norm_in, BatchNormConfig, RunningStats};

struct Params<B: Backend> {
    gamma: Variable<B>,
    beta: Variable<B>,
    stats: RunningStats<B>,
}

/// Batch normalization with learnable scale and shift: y = gamma * x_hat + beta
///
/// Parameters and running statistics are created on the first call, sized
/// from the channel axis (axis 1) of its input.
pub struct BatchNorm<B: Backend> {
    config: BatchNormConfig,
    params: Option<Params<B>>,
}

impl<B: Backend> Default for BatchNorm<B> {
    fn default() -> Self {
        Self::new(BatchNormConfig::default())
    }
}

impl<B: Backend> BatchNorm<B> {
    pub fn new(config: BatchNormConfig) -> Self {
        BatchNorm { config, params: None }
    }

    pub fn config(&self) -> BatchNormConfig {
        self.config
    }

    /// Forward pass in the thread's current [`Mode`].
    pub fn forward(&mut self, x: &Variable<B>) -> Result<Variable<B>> {
        self.forward_in(x, mode::current())
    }

    /// Forward pass in an explicit mode.
    ///
    /// Input x has shape [batch, channels] or [batch, channels, height, width].
    pub fn forward_in(&mut self, x: &Variable<B>, mode: Mode) -> Result<Variable<B>> {
        if !matches!(x.ndim(), 2 | 4) {
            return Err(AutodiffError::RankMismatch {
                function: "batch_norm",
                expected: "2 or 4",
                actual: x.ndim(),
            });
        }
        let config = self.config;
        let params = self.params.get_or_insert_with(|| {
            let channels = x.shape().dim(1);
            debug!(channels, backend = B::name(), "initializing batch norm parameters");
            let shape = Shape::new(vec![channels]);
            Params {
                gamma: Variable::named("gamma", B::ones(&shape)),
                beta: Variable::named("beta", B::zeros(&shape)),
                stats: RunningStats::new(channels),
            }
        });
        batch_norm_in(x, &params.gamma, &params.beta, &params.stats, config, mode)
    }

    /// Number of channels, once initialized.
    pub fn channels(&self) -> Option<usize> {
        self.params.as_ref().map(|p| p.stats.channels())
    }

    pub fn gamma(&self) -> Option<&Variable<B>> {
        self.params.as_ref().map(|p| &p.gamma)
    }

    pub fn beta(&self) -> Option<&Variable<B>> {
        self.params.as_ref().map(|p| &p.beta)
    }

    /// Shared handle to the running statistics, once initialized.
    pub fn running_stats(&self) -> Option<RunningStats<B>> {
        self.params.as_ref().map(|p| p.stats.clone())
    }

    /// Trainable parameters: `[gamma, beta]`, or nothing before the first call.
    pub fn params(&self) -> Vec<&Variable<B>> {
        match &self.params {
            Some(p) => vec![&p.gamma, &p.beta],
            None => Vec::new(),
        }
    }

    /// Mutable access for optimizers that replace parameter values.
    pub fn params_mut(&mut self) -> Vec<&mut Variable<B>> {
        match &mut self.params {
            Some(p) => vec![&mut p.gamma, &mut p.beta],
            None => Vec::new(),
        }
    }

    pub fn cleargrads(&self) {
        for p in self.params() {
            p.cleargrad();
        }
    }
}
