use std::fmt;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use smallvec::SmallVec;

use crate::autograd::{self, GradNode};
use crate::storage::CpuBuffer;
use crate::{DType, Device, FuseError, Result, Shape, Storage};

/// A strided view over shared storage.
///
/// Cloning a tensor or taking a view never copies data; only `contiguous`,
/// `to_dtype` and the constructors allocate.
///
/// ```
/// use fusekit_core::Tensor;
///
/// let qkv = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// let k = qkv.select(1, 1).unwrap();
/// assert_eq!(k.to_vec_f32(), vec![2.0, 5.0]);
/// assert!(k.shares_storage(&qkv));
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
    strides: SmallVec<[usize; 6]>,
    offset: usize,
    requires_grad: bool,
    grad_node: Option<Arc<GradNode>>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    fn from_storage(storage: Storage, shape: &[usize]) -> Self {
        let shape = Shape::new(shape);
        let strides = shape.contiguous_strides();
        Self {
            storage,
            shape,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        }
    }

    /// Create a tensor from a host buffer and shape.
    pub fn from_buffer(buffer: CpuBuffer, shape: &[usize]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if buffer.len() != numel {
            return Err(FuseError::InvalidReshape {
                numel: buffer.len(),
                shape: shape.to_vec(),
            });
        }
        Ok(Self::from_storage(Storage::from_buffer(buffer), shape))
    }

    /// Create an F32 tensor from data and shape.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            numel,
            data.len(),
            "shape {:?} requires {} elements, got {}",
            shape,
            numel,
            data.len()
        );
        Self::from_storage(Storage::from_buffer(CpuBuffer::F32(data.to_vec())), shape)
    }

    /// Create an I32 tensor, e.g. cumulative sequence lengths.
    pub fn from_i32(data: &[i32], shape: &[usize]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(numel, data.len(), "shape {:?} requires {} elements", shape, numel);
        Self::from_storage(Storage::from_buffer(CpuBuffer::I32(data.to_vec())), shape)
    }

    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel = shape.iter().product();
        Self::from_storage(Storage::zeros(dtype, numel), shape)
    }

    /// Tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let t = Self::zeros(shape, dtype);
        t.storage.write(|b| (0..b.len()).for_each(|i| b.store(i, value)));
        t
    }

    /// F32 tensor of ones.
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0, DType::F32)
    }

    /// F32 tensor of standard-normal samples from a seeded stream.
    pub fn randn(shape: &[usize], seed: u64) -> Self {
        let numel: usize = shape.iter().product();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        // Box-Muller
        let data: Vec<f32> = (0..numel)
            .map(|_| {
                let u1: f32 = rng.gen_range(1e-7f32..1.0f32);
                let u2: f32 = rng.gen_range(0.0f32..std::f32::consts::TAU);
                (-2.0 * u1.ln()).sqrt() * u2.cos()
            })
            .collect();
        Self::from_f32(&data, shape)
    }

    /// Fresh contiguous zero tensor with this tensor's shape and dtype.
    pub fn zeros_like(&self) -> Self {
        Self::zeros(self.shape.dims(), self.dtype())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    pub fn device(&self) -> Device {
        self.storage.device()
    }

    /// Strides in elements.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Offset of the first element in the storage, in elements.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Whether both tensors view the same underlying buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        self.storage.same_buffer(&other.storage)
    }

    pub fn is_contiguous(&self) -> bool {
        self.offset == 0
            && self.numel() == self.storage.numel()
            && self.strides == self.shape.contiguous_strides()
    }

    // =========================================================================
    // Autograd
    // =========================================================================

    pub fn requires_grad(&self) -> bool {
        self.requires_grad
    }

    /// Mark this tensor as a leaf that accumulates gradients.
    pub fn set_requires_grad(&mut self, requires_grad: bool) {
        self.requires_grad = requires_grad;
        if requires_grad && self.grad_node.is_none() {
            self.grad_node = Some(GradNode::leaf());
        }
        if !requires_grad {
            self.grad_node = None;
        }
    }

    pub fn grad_node(&self) -> Option<&Arc<GradNode>> {
        self.grad_node.as_ref()
    }

    /// Attach a graph node produced by a differentiable op.
    pub fn with_grad_node(mut self, node: Arc<GradNode>) -> Self {
        self.grad_node = Some(node);
        self.requires_grad = true;
        self
    }

    /// Same data, no graph.
    pub fn detach(&self) -> Self {
        let mut t = self.clone();
        t.requires_grad = false;
        t.grad_node = None;
        t
    }

    /// Accumulated gradient, if backward reached this tensor.
    pub fn grad(&self) -> Option<Tensor> {
        self.grad_node.as_ref().and_then(|n| n.get_grad())
    }

    pub fn zero_grad(&self) {
        if let Some(node) = &self.grad_node {
            node.zero_grad();
        }
    }

    /// Whether ops on this tensor should record a graph node.
    pub fn tracks_grad(&self) -> bool {
        self.requires_grad && self.grad_node.is_some() && autograd::is_grad_enabled()
    }

    /// Backpropagate `grad_output` from this tensor, releasing saved
    /// contexts along the way.
    pub fn backward_with(&self, grad_output: Tensor) -> Result<()> {
        let node = self.grad_node.as_ref().ok_or_else(|| {
            FuseError::Autograd("backward called on a tensor without a graph".into())
        })?;
        autograd::backward(node, grad_output)
    }

    /// Like `backward_with` but keeps every saved context for another pass.
    pub fn backward_retain_graph(&self, grad_output: Tensor) -> Result<()> {
        let node = self.grad_node.as_ref().ok_or_else(|| {
            FuseError::Autograd("backward called on a tensor without a graph".into())
        })?;
        autograd::backward_retain_graph(node, grad_output)
    }

    // =========================================================================
    // Element access
    // =========================================================================

    /// Storage index of the element at row-major position `flat`.
    fn physical_index(&self, flat: usize) -> usize {
        let mut remaining = flat;
        let mut physical = self.offset;
        for axis in (0..self.ndim()).rev() {
            let size = self.shape.dims()[axis];
            physical += (remaining % size) * self.strides[axis];
            remaining /= size;
        }
        physical
    }

    fn physical_indices(&self) -> Vec<usize> {
        (0..self.numel()).map(|i| self.physical_index(i)).collect()
    }

    /// All elements in logical order, widened to f64.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        let indices = self.physical_indices();
        self.storage.read(|b| indices.iter().map(|&p| b.load(p)).collect())
    }

    /// All elements in logical order as f32.
    pub fn to_vec_f32(&self) -> Vec<f32> {
        let indices = self.physical_indices();
        self.storage.read(|b| indices.iter().map(|&p| b.load(p) as f32).collect())
    }

    /// All elements in logical order as i64 (index tensors).
    pub fn to_vec_i64(&self) -> Vec<i64> {
        let indices = self.physical_indices();
        self.storage.read(|b| indices.iter().map(|&p| b.load(p) as i64).collect())
    }

    pub fn get_f32(&self, flat: usize) -> Option<f32> {
        if flat >= self.numel() {
            return None;
        }
        let p = self.physical_index(flat);
        Some(self.storage.read(|b| b.load(p)) as f32)
    }

    /// Write `src` into this view element by element, converting dtype.
    ///
    /// Writes go to the shared storage, so every other view of the same
    /// buffer observes them.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        if self.dims() != src.dims() {
            return Err(FuseError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: src.dims().to_vec(),
            });
        }
        let values = src.to_vec_f64();
        let indices = self.physical_indices();
        self.storage.write(|b| {
            for (&p, &v) in indices.iter().zip(values.iter()) {
                b.store(p, v);
            }
        });
        Ok(())
    }

    // =========================================================================
    // Views
    // =========================================================================

    /// View with `axis` fixed at `index`; the axis is removed.
    pub fn select(&self, axis: usize, index: usize) -> Result<Tensor> {
        let size = self.shape.dim(axis).ok_or(FuseError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })?;
        if index >= size {
            return Err(FuseError::IndexOutOfRange { index, axis, size });
        }
        let shape = self.shape.without_axis(axis).ok_or(FuseError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })?;
        let mut strides = self.strides.clone();
        let stride = strides.remove(axis);
        Ok(Tensor {
            storage: self.storage.clone(),
            shape,
            strides,
            offset: self.offset + index * stride,
            requires_grad: false,
            grad_node: None,
        })
    }

    /// View of `len` entries along `axis` starting at `start`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        let size = self.shape.dim(axis).ok_or(FuseError::InvalidAxis {
            axis,
            ndim: self.ndim(),
        })?;
        if start + len > size {
            return Err(FuseError::IndexOutOfRange {
                index: start + len,
                axis,
                size,
            });
        }
        let mut dims = self.dims().to_vec();
        dims[axis] = len;
        Ok(Tensor {
            storage: self.storage.clone(),
            shape: Shape::from(dims),
            strides: self.strides.clone(),
            offset: self.offset + start * self.strides[axis],
            requires_grad: false,
            grad_node: None,
        })
    }

    /// Reshape a contiguous tensor without copying.
    pub fn reshape(&self, new_shape: &[isize]) -> Result<Tensor> {
        let shape = self.shape.resolve_reshape(new_shape).ok_or_else(|| {
            FuseError::InvalidReshape {
                numel: self.numel(),
                shape: new_shape.iter().map(|&d| d.max(0) as usize).collect(),
            }
        })?;
        if !self.is_contiguous() {
            return Err(FuseError::InvalidArgument(
                "cannot reshape a non-contiguous view; call contiguous() first".into(),
            ));
        }
        let strides = shape.contiguous_strides();
        Ok(Tensor {
            storage: self.storage.clone(),
            shape,
            strides,
            offset: 0,
            requires_grad: false,
            grad_node: None,
        })
    }

    // =========================================================================
    // Copies
    // =========================================================================

    /// Contiguous copy (detached), or a clone when already contiguous.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        let out = Tensor::zeros(self.dims(), self.dtype());
        let values = self.to_vec_f64();
        out.storage.write(|b| {
            for (i, v) in values.into_iter().enumerate() {
                b.store(i, v);
            }
        });
        out
    }

    /// Cast to `dtype`. Returns `self` unchanged (graph included) when the
    /// dtype already matches; otherwise a detached contiguous copy.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        if self.dtype() == dtype {
            return self.clone();
        }
        let out = Tensor::zeros(self.dims(), dtype);
        let values = self.to_vec_f64();
        out.storage.write(|b| {
            for (i, v) in values.into_iter().enumerate() {
                b.store(i, v);
            }
        });
        out
    }

    /// Element-wise sum of two same-shaped tensors, in `self`'s dtype.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.dims() != other.dims() {
            return Err(FuseError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: other.dims().to_vec(),
            });
        }
        let lhs = self.to_vec_f64();
        let rhs = other.to_vec_f64();
        let out = Tensor::zeros(self.dims(), self.dtype());
        out.storage.write(|b| {
            for (i, (a, c)) in lhs.iter().zip(rhs.iter()).enumerate() {
                b.store(i, a + c);
            }
        });
        Ok(out)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={}, contiguous={}, requires_grad={})",
            self.shape,
            self.dtype(),
            self.device(),
            self.is_contiguous(),
            self.requires_grad,
        )
    }
}
