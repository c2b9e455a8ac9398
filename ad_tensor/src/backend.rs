//! Backend trait - the array namespace every function dispatches to.
//!
//! A backend is the device-dispatch seam: functions never touch raw memory,
//! they call `B::op(..)` on whichever backend type the graph was built with.

use crate::shape::Shape;
use crate::tensor::TensorData;

/// Array operations a compute backend provides.
///
/// Binary operations broadcast their operands. Comparisons return mask
/// tensors holding `0.0` or `1.0`.
pub trait Backend: Clone + 'static {
    /// The tensor type for this backend.
    type Tensor: TensorData;

    /// Short identifier used in logs.
    fn name() -> &'static str;

    // === Creation ===

    /// Create a tensor of zeros with the given shape.
    fn zeros(shape: &Shape) -> Self::Tensor;

    /// Create a tensor of ones with the given shape.
    fn ones(shape: &Shape) -> Self::Tensor;

    /// Create a tensor from a flat data vector and shape.
    fn from_vec(data: Vec<f32>, shape: Shape) -> Self::Tensor;

    /// Create a scalar (0-dim) tensor.
    fn scalar(value: f32) -> Self::Tensor;

    /// Create a tensor filled with a constant value.
    fn full(shape: &Shape, value: f32) -> Self::Tensor;

    // === Element-wise ===

    /// Negate: -x
    fn neg(x: &Self::Tensor) -> Self::Tensor;

    /// Square root: sqrt(x)
    fn sqrt(x: &Self::Tensor) -> Self::Tensor;

    /// Clamp every element into `[lo, hi]`.
    fn clip(x: &Self::Tensor, lo: f32, hi: f32) -> Self::Tensor;

    /// Addition: a + b
    fn add(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    /// Subtraction: a - b
    fn sub(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    /// Multiplication: a * b
    fn mul(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    /// Division: a / b
    fn div(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    // === Comparison ===

    /// Greater than or equal: a >= b
    fn ge(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    /// Less than or equal: a <= b
    fn le(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    /// Equal: a == b
    fn eq(a: &Self::Tensor, b: &Self::Tensor) -> Self::Tensor;

    // === Reductions ===

    /// Sum over specified axes (None = all axes -> scalar).
    fn sum(x: &Self::Tensor, axes: Option<&[usize]>, keepdims: bool) -> Self::Tensor;

    /// Mean over specified axes (None = all axes -> scalar).
    fn mean(x: &Self::Tensor, axes: Option<&[usize]>, keepdims: bool) -> Self::Tensor;

    /// Max over specified axes (None = all axes -> scalar).
    fn max(x: &Self::Tensor, axes: Option<&[usize]>, keepdims: bool) -> Self::Tensor;

    /// Min over specified axes (None = all axes -> scalar).
    fn min(x: &Self::Tensor, axes: Option<&[usize]>, keepdims: bool) -> Self::Tensor;

    /// Population variance (divisor `n`) over specified axes.
    fn var(x: &Self::Tensor, axes: Option<&[usize]>, keepdims: bool) -> Self::Tensor {
        let mean = Self::mean(x, axes, true);
        let centered = Self::sub(x, &mean);
        let squared = Self::mul(&centered, &centered);
        Self::mean(&squared, axes, keepdims)
    }

    // === Shape operations ===

    /// Permute axes. None = reverse all axes.
    fn transpose(x: &Self::Tensor, axes: Option<&[usize]>) -> Self::Tensor;

    /// Reshape to new shape (must have same numel).
    fn reshape(x: &Self::Tensor, shape: &Shape) -> Self::Tensor;

    /// Broadcast to a larger shape.
    fn broadcast_to(x: &Self::Tensor, shape: &Shape) -> Self::Tensor;

    /// Sum along broadcast axes to reduce `x` back to `shape`.
    fn sum_to(x: &Self::Tensor, shape: &Shape) -> Self::Tensor;
}
