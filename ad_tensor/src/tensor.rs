//! TensorData trait - the raw array a backend hands to the graph.

use crate::shape::{Shape, Strides};

/// Raw tensor storage produced and consumed by a [`Backend`](crate::Backend).
///
/// Values are always `f32`. Graph nodes hold one of these immutably; every
/// backend operation returns a fresh tensor.
pub trait TensorData: Clone + 'static {
    /// Get the shape of this tensor.
    fn shape(&self) -> &Shape;

    /// Get the strides of this tensor.
    fn strides(&self) -> &Strides;

    /// Get the total number of elements.
    fn numel(&self) -> usize {
        self.shape().numel()
    }

    /// Number of dimensions.
    fn ndim(&self) -> usize {
        self.shape().ndim()
    }

    /// Get data as a contiguous f32 slice.
    fn as_slice(&self) -> &[f32];

    /// Copy the data out into an owned vector.
    fn to_vec(&self) -> Vec<f32> {
        self.as_slice().to_vec()
    }

    /// Get scalar value (panics if the tensor holds more than one element).
    fn scalar_value(&self) -> f32 {
        assert_eq!(self.numel(), 1, "Expected single-element tensor, got {}", self.shape());
        self.as_slice()[0]
    }
}
