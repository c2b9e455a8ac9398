//! Stateful layers that own their parameters.

pub mod batch_norm;

pub use batch_norm::BatchNorm;
