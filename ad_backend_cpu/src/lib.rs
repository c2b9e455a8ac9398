//! CPU array backend for ad_tensor.

use ad_tensor::prelude::*;

/// CPU tensor storage.
#[derive(Clone, Debug)]
pub struct CpuTensor {
    data: Vec<f32>,
    shape: Shape,
    strides: Strides,
}

impl CpuTensor {
    /// Create a new CPU tensor from data and shape.
    pub fn new(data: Vec<f32>, shape: Shape) -> Self {
        let strides = shape.contiguous_strides();
        assert_eq!(
            data.len(),
            shape.numel(),
            "Data length {} doesn't match shape {:?} (numel={})",
            data.len(),
            shape,
            shape.numel()
        );
        CpuTensor { data, shape, strides }
    }

    fn flat_index(&self, indices: &[usize]) -> usize {
        self.strides.index(indices)
    }

    fn indices(&self) -> TensorIndices<'_> {
        TensorIndices::new(&self.shape)
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> CpuTensor {
        CpuTensor::new(self.data.iter().map(|&v| f(v)).collect(), self.shape.clone())
    }
}

impl TensorData for CpuTensor {
    fn shape(&self) -> &Shape {
        &self.shape
    }

    fn strides(&self) -> &Strides {
        &self.strides
    }

    fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// Odometer over every multi-dimensional index of a shape, row-major.
struct TensorIndices<'a> {
    shape: &'a Shape,
    current: Vec<usize>,
    done: bool,
}

impl<'a> TensorIndices<'a> {
    fn new(shape: &'a Shape) -> Self {
        TensorIndices {
            shape,
            current: vec![0; shape.ndim()],
            done: shape.numel() == 0,
        }
    }
}

impl Iterator for TensorIndices<'_> {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = self.current.clone();
        if self.shape.ndim() == 0 {
            self.done = true;
            return Some(result);
        }

        let mut i = self.shape.ndim() - 1;
        loop {
            self.current[i] += 1;
            if self.current[i] < self.shape.dim(i) {
                break;
            }
            self.current[i] = 0;
            if i == 0 {
                self.done = true;
                break;
            }
            i -= 1;
        }

        Some(result)
    }
}

/// CPU backend marker type.
#[derive(Clone, Copy, Debug)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Tensor = CpuTensor;

    fn name() -> &'static str {
        "cpu"
    }

    // === Creation ===

    fn zeros(shape: &Shape) -> CpuTensor {
        Self::full(shape, 0.0)
    }

    fn ones(shape: &Shape) -> CpuTensor {
        Self::full(shape, 1.0)
    }

    fn from_vec(data: Vec<f32>, shape: Shape) -> CpuTensor {
        CpuTensor::new(data, shape)
    }

    fn scalar(value: f32) -> CpuTensor {
        CpuTensor::new(vec![value], Shape::scalar())
    }

    fn full(shape: &Shape, value: f32) -> CpuTensor {
        CpuTensor::new(vec![value; shape.numel()], shape.clone())
    }

    // === Element-wise ===

    fn neg(x: &CpuTensor) -> CpuTensor {
        x.map(|v| -v)
    }

    fn sqrt(x: &CpuTensor) -> CpuTensor {
        x.map(f32::sqrt)
    }

    fn clip(x: &CpuTensor, lo: f32, hi: f32) -> CpuTensor {
        x.map(|v| v.max(lo).min(hi))
    }

    fn add(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| x + y)
    }

    fn sub(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| x - y)
    }

    fn mul(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| x * y)
    }

    fn div(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| x / y)
    }

    // === Comparison ===

    fn ge(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| if x >= y { 1.0 } else { 0.0 })
    }

    fn le(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| if x <= y { 1.0 } else { 0.0 })
    }

    fn eq(a: &CpuTensor, b: &CpuTensor) -> CpuTensor {
        binary_op_broadcast(a, b, |x, y| if x == y { 1.0 } else { 0.0 })
    }

    // === Reductions ===

    fn sum(x: &CpuTensor, axes: Option<&[usize]>, keepdims: bool) -> CpuTensor {
        reduce_op(x, axes, keepdims, 0.0, |acc, v| acc + v)
    }

    fn mean(x: &CpuTensor, axes: Option<&[usize]>, keepdims: bool) -> CpuTensor {
        let sum = Self::sum(x, axes, keepdims);
        let count = match axes {
            Some(axes) => axes.iter().map(|&ax| x.shape.dim(ax)).product::<usize>(),
            None => x.shape.numel(),
        };
        Self::div(&sum, &Self::scalar(count as f32))
    }

    fn max(x: &CpuTensor, axes: Option<&[usize]>, keepdims: bool) -> CpuTensor {
        reduce_op(x, axes, keepdims, f32::NEG_INFINITY, f32::max)
    }

    fn min(x: &CpuTensor, axes: Option<&[usize]>, keepdims: bool) -> CpuTensor {
        reduce_op(x, axes, keepdims, f32::INFINITY, f32::min)
    }

    // === Shape operations ===

    fn transpose(x: &CpuTensor, axes: Option<&[usize]>) -> CpuTensor {
        let ndim = x.shape.ndim();
        if ndim == 0 {
            return x.clone();
        }

        let perm: Vec<usize> = axes
            .map(<[usize]>::to_vec)
            .unwrap_or_else(|| (0..ndim).rev().collect());

        let new_shape = x.shape.permuted(&perm);
        let new_strides = new_shape.contiguous_strides();
        let mut data = vec![0.0f32; x.shape.numel()];

        for idx in x.indices() {
            let new_idx: Vec<usize> = perm.iter().map(|&i| idx[i]).collect();
            data[new_strides.index(&new_idx)] = x.data[x.flat_index(&idx)];
        }

        CpuTensor::new(data, new_shape)
    }

    fn reshape(x: &CpuTensor, shape: &Shape) -> CpuTensor {
        assert_eq!(
            x.shape.numel(),
            shape.numel(),
            "Cannot reshape from {:?} to {:?}",
            x.shape,
            shape
        );
        CpuTensor::new(x.data.clone(), shape.clone())
    }

    fn broadcast_to(x: &CpuTensor, shape: &Shape) -> CpuTensor {
        if x.shape() == shape {
            return x.clone();
        }

        let x_ndim = x.shape.ndim();
        let offset = shape.ndim() - x_ndim;
        let out_strides = shape.contiguous_strides();
        let mut data = vec![0.0f32; shape.numel()];

        for out_idx in TensorIndices::new(shape) {
            // Size-1 input axes always read index 0.
            let in_idx: Vec<usize> = (0..x_ndim)
                .map(|i| if x.shape.dim(i) == 1 { 0 } else { out_idx[offset + i] })
                .collect();
            data[out_strides.index(&out_idx)] = x.data[x.flat_index(&in_idx)];
        }

        CpuTensor::new(data, shape.clone())
    }

    fn sum_to(x: &CpuTensor, shape: &Shape) -> CpuTensor {
        if x.shape() == shape {
            return x.clone();
        }

        let axes = shape.reduction_axes_from(&x.shape);
        if axes.is_empty() {
            return Self::reshape(x, shape);
        }

        let result = Self::sum(x, Some(&axes), false);
        Self::reshape(&result, shape)
    }
}

/// Binary operation with broadcasting.
fn binary_op_broadcast<F>(a: &CpuTensor, b: &CpuTensor, op: F) -> CpuTensor
where
    F: Fn(f32, f32) -> f32,
{
    let out_shape = match a.shape.broadcast_with(&b.shape) {
        Some(shape) => shape,
        None => panic!("Shapes {} and {} are not broadcast compatible", a.shape, b.shape),
    };

    let a_broadcast = CpuBackend::broadcast_to(a, &out_shape);
    let b_broadcast = CpuBackend::broadcast_to(b, &out_shape);

    let data: Vec<f32> = a_broadcast
        .data
        .iter()
        .zip(b_broadcast.data.iter())
        .map(|(&x, &y)| op(x, y))
        .collect();

    CpuTensor::new(data, out_shape)
}

/// Reduction operation over specified axes.
fn reduce_op<F>(
    x: &CpuTensor,
    axes: Option<&[usize]>,
    keepdims: bool,
    init: f32,
    op: F,
) -> CpuTensor
where
    F: Fn(f32, f32) -> f32,
{
    let ndim = x.shape.ndim();
    if ndim == 0 {
        return x.clone();
    }

    let reduce_axes: Vec<usize> = axes
        .map(<[usize]>::to_vec)
        .unwrap_or_else(|| (0..ndim).collect());

    // Index into the output for a given input index: reduced axes collapse
    // to 0 (keepdims) or vanish.
    let project = |idx: &[usize]| -> Vec<usize> {
        (0..ndim)
            .filter_map(|i| match (reduce_axes.contains(&i), keepdims) {
                (true, true) => Some(0),
                (true, false) => None,
                (false, _) => Some(idx[i]),
            })
            .collect()
    };

    let out_shape = if keepdims {
        x.shape.keepdims(Some(&reduce_axes))
    } else {
        Shape::new(
            (0..ndim)
                .filter(|i| !reduce_axes.contains(i))
                .map(|i| x.shape.dim(i))
                .collect(),
        )
    };
    let out_strides = out_shape.contiguous_strides();

    let mut data = vec![init; out_shape.numel()];
    for in_idx in x.indices() {
        let out_flat = out_strides.index(&project(&in_idx));
        data[out_flat] = op(data[out_flat], x.data[x.flat_index(&in_idx)]);
    }

    CpuTensor::new(data, out_shape)
}

/// Variables on the CPU backend.
pub type CpuVariable = Variable<CpuBackend>;

/// Create a leaf variable from flat data and dimensions.
pub fn variable(data: Vec<f32>, dims: &[usize]) -> CpuVariable {
    Variable::new(CpuBackend::from_vec(data, Shape::from(dims)))
}

/// Create a named leaf variable from flat data and dimensions.
pub fn named_variable(name: &str, data: Vec<f32>, dims: &[usize]) -> CpuVariable {
    Variable::named(name, CpuBackend::from_vec(data, Shape::from(dims)))
}

/// Central-difference gradient of `sum(f(inputs))` with respect to every
/// element of every input.
///
/// `f` runs with graph recording off, so the check leaves no nodes behind.
pub fn finite_diff_grad<F>(
    f: F,
    inputs: &[Vec<f32>],
    shapes: &[Shape],
    eps: f32,
) -> Result<Vec<Vec<f32>>>
where
    F: Fn(&[CpuVariable]) -> Result<CpuVariable>,
{
    let _no_grad = mode::no_grad();

    let eval = |input_idx: usize, elem_idx: usize, delta: f32| -> Result<f32> {
        let vars: Vec<CpuVariable> = inputs
            .iter()
            .zip(shapes)
            .enumerate()
            .map(|(i, (inp, sh))| {
                let mut data = inp.clone();
                if i == input_idx {
                    data[elem_idx] += delta;
                }
                Variable::new(CpuBackend::from_vec(data, sh.clone()))
            })
            .collect();
        let out = f(&vars)?;
        Ok(out.as_slice().iter().map(|&v| v as f64).sum::<f64>() as f32)
    };

    let mut grads = Vec::with_capacity(inputs.len());
    for (input_idx, input) in inputs.iter().enumerate() {
        let mut input_grads = Vec::with_capacity(input.len());
        for elem_idx in 0..input.len() {
            let plus = eval(input_idx, elem_idx, eps)?;
            let minus = eval(input_idx, elem_idx, -eps)?;
            input_grads.push((plus - minus) / (2.0 * eps));
        }
        grads.push(input_grads);
    }

    Ok(grads)
}
