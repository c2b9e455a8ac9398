//! Differentiable operators built on the graph engine.

pub mod batch_norm;
pub mod clip;
pub mod max;

pub use batch_norm::{batch_norm, batch_norm_in, BatchNormConfig, BatchNormFn, RunningStats};
pub use clip::{clip, Clip};
pub use max::{max, min, Max, Min};
