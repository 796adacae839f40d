use std::ffi::c_void;
use std::sync::Arc;

use half::{bf16, f16};
use parking_lot::RwLock;

use crate::{DType, Device};

/// Host buffer, one variant per dtype.
#[derive(Debug, Clone)]
pub enum CpuBuffer {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl CpuBuffer {
    fn zeros(dtype: DType, numel: usize) -> Self {
        match dtype {
            DType::F16 => CpuBuffer::F16(vec![f16::ZERO; numel]),
            DType::BF16 => CpuBuffer::BF16(vec![bf16::ZERO; numel]),
            DType::F32 => CpuBuffer::F32(vec![0.0; numel]),
            DType::F64 => CpuBuffer::F64(vec![0.0; numel]),
            DType::U8 => CpuBuffer::U8(vec![0; numel]),
            DType::I32 => CpuBuffer::I32(vec![0; numel]),
            DType::I64 => CpuBuffer::I64(vec![0; numel]),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            CpuBuffer::F16(_) => DType::F16,
            CpuBuffer::BF16(_) => DType::BF16,
            CpuBuffer::F32(_) => DType::F32,
            CpuBuffer::F64(_) => DType::F64,
            CpuBuffer::U8(_) => DType::U8,
            CpuBuffer::I32(_) => DType::I32,
            CpuBuffer::I64(_) => DType::I64,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CpuBuffer::F16(v) => v.len(),
            CpuBuffer::BF16(v) => v.len(),
            CpuBuffer::F32(v) => v.len(),
            CpuBuffer::F64(v) => v.len(),
            CpuBuffer::U8(v) => v.len(),
            CpuBuffer::I32(v) => v.len(),
            CpuBuffer::I64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read one element widened to f64 (exact for every supported dtype
    /// except i64 beyond 2^53).
    #[inline]
    pub fn load(&self, idx: usize) -> f64 {
        match self {
            CpuBuffer::F16(v) => v[idx].to_f64(),
            CpuBuffer::BF16(v) => v[idx].to_f64(),
            CpuBuffer::F32(v) => v[idx] as f64,
            CpuBuffer::F64(v) => v[idx],
            CpuBuffer::U8(v) => v[idx] as f64,
            CpuBuffer::I32(v) => v[idx] as f64,
            CpuBuffer::I64(v) => v[idx] as f64,
        }
    }

    /// Write one element, rounding to the buffer's dtype.
    #[inline]
    pub fn store(&mut self, idx: usize, value: f64) {
        match self {
            CpuBuffer::F16(v) => v[idx] = f16::from_f64(value),
            CpuBuffer::BF16(v) => v[idx] = bf16::from_f64(value),
            CpuBuffer::F32(v) => v[idx] = value as f32,
            CpuBuffer::F64(v) => v[idx] = value,
            CpuBuffer::U8(v) => v[idx] = value as u8,
            CpuBuffer::I32(v) => v[idx] = value as i32,
            CpuBuffer::I64(v) => v[idx] = value as i64,
        }
    }

    fn as_mut_ptr(&mut self) -> *mut c_void {
        match self {
            CpuBuffer::F16(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::BF16(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::F32(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::F64(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::U8(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::I32(v) => v.as_mut_ptr() as *mut c_void,
            CpuBuffer::I64(v) => v.as_mut_ptr() as *mut c_void,
        }
    }
}

/// Shared, reference-counted tensor storage.
///
/// Every view created from a tensor (`select`, `narrow`, `reshape`) shares
/// the same buffer, and writes through one view are visible through all
/// others. This is what lets a backward kernel fill the three slices of a
/// packed gradient in place.
#[derive(Debug, Clone)]
pub struct Storage {
    data: Arc<RwLock<CpuBuffer>>,
    dtype: DType,
    device: Device,
    numel: usize,
}

impl Storage {
    /// Allocate zero-initialised host storage.
    pub fn zeros(dtype: DType, numel: usize) -> Self {
        Self::from_buffer(CpuBuffer::zeros(dtype, numel))
    }

    pub fn from_buffer(buffer: CpuBuffer) -> Self {
        Self {
            dtype: buffer.dtype(),
            numel: buffer.len(),
            data: Arc::new(RwLock::new(buffer)),
            device: Device::Cpu,
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn numel(&self) -> usize {
        self.numel
    }

    pub fn nbytes(&self) -> usize {
        self.numel * self.dtype.size_in_bytes()
    }

    /// Run `f` with shared access to the buffer.
    pub fn read<R>(&self, f: impl FnOnce(&CpuBuffer) -> R) -> R {
        f(&self.data.read())
    }

    /// Run `f` with exclusive access to the buffer.
    pub fn write<R>(&self, f: impl FnOnce(&mut CpuBuffer) -> R) -> R {
        f(&mut self.data.write())
    }

    /// Whether two storages share the same buffer.
    pub fn same_buffer(&self, other: &Storage) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Raw base pointer of the buffer for foreign kernels.
    ///
    /// # Safety
    /// The pointer is taken under the write lock, which is released before
    /// returning. The caller must keep this storage alive for as long as the
    /// pointer is used and must not hold a `read`/`write` guard on the same
    /// storage while foreign code writes through it.
    pub unsafe fn raw_ptr(&self) -> *mut c_void {
        self.data.write().as_mut_ptr()
    }
}
