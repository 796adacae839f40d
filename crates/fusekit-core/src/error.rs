use crate::{DType, Device};

/// Errors raised by tensors, the autograd engine and kernel backends.
///
/// Bridges never translate these: a kernel failure reaches the caller with
/// the variant the kernel produced.
#[derive(Debug, thiserror::Error)]
pub enum FuseError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    #[error("unsupported dtype: {0}")]
    UnsupportedDType(DType),

    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    #[error("axis {axis} out of range for tensor of rank {ndim}")]
    InvalidAxis { axis: usize, ndim: usize },

    #[error("index {index} out of range for axis {axis} of size {size}")]
    IndexOutOfRange { index: usize, axis: usize, size: usize },

    #[error("cannot reshape {numel} elements into {shape:?}")]
    InvalidReshape { numel: usize, shape: Vec<usize> },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend '{backend}' does not provide capability '{capability}'")]
    MissingCapability {
        backend: String,
        capability: &'static str,
    },

    #[error("failed to load kernel extension '{path}': {reason}")]
    ExtensionLoad { path: String, reason: String },

    #[error("kernel extension ABI version {got} does not match expected {expected}")]
    AbiMismatch { expected: u32, got: u32 },

    #[error("kernel '{op}' failed with status {code}")]
    Kernel { op: &'static str, code: i32 },

    #[error("device mismatch: expected {expected}, got {got}")]
    DeviceMismatch { expected: Device, got: Device },

    #[error("cannot restore RNG state captured on {state} into a generator on {generator}")]
    RngStateMismatch { generator: Device, state: Device },

    #[error("autograd error: {0}")]
    Autograd(String),
}
