//! # ad_nn - Differentiable Operators for ad_tensor
//!
//! This crate provides operators and layers on top of the ad_tensor autodiff engine:
//!
//! - **Reductions**: `max`, `min` over chosen axes, with gradients routed to
//!   every extremal position
//! - **Element-wise**: `clip`
//! - **Normalization**: `batch_norm` and the stateful [`BatchNorm`] layer
//!
//! Everything is generic over the [`Backend`](ad_tensor::Backend).
//!
//! ## Example: Normalizing a Batch
//!
//! ```ignore
//! use ad_nn::{clip, max, BatchNorm};
//! use ad_backend_cpu::variable;
//! use ad_tensor::prelude::*;
//!
//! let mut bn = BatchNorm::default();
//! let x = variable(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[3, 2]);
//!
//! // Training step: batch statistics, running averages updated
//! let h = clip(&bn.forward(&x)?, -1.0, 1.0)?;
//! max(&h, Some(&[1]), false)?.sum(None, false)?.backward()?;
//!
//! // Evaluation: running averages, nothing updated
//! let _eval = mode::test_mode();
//! let y = bn.forward(&x)?;
//! ```

pub mod functions;
pub mod layers;

pub use functions::{
    batch_norm, batch_norm_in, clip, max, min, BatchNormConfig, BatchNormFn, Clip, Max, Min,
    RunningStats,
};
pub use layers::BatchNorm;
