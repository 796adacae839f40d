//! # fusekit-core
//!
//! Core tensor engine shared by the fusekit kernel bridges.
//!
//! Provides:
//! - `Tensor` with shared storage and zero-copy views (`select`, `narrow`)
//! - Reduced-precision dtypes (F16, BF16) next to F32/F64 and index types
//! - A tape-based autograd engine (`GradFn`, `GradNode`, `backward`)
//! - Device-bound `Generator` with restorable state snapshots

pub mod autograd;
pub mod device;
pub mod dtype;
pub mod error;
pub mod generator;
pub mod shape;
pub mod storage;
pub mod tensor;

pub use device::Device;
pub use dtype::DType;
pub use error::FuseError;
pub use generator::{Generator, RngState};
pub use shape::Shape;
pub use storage::Storage;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, FuseError>;
