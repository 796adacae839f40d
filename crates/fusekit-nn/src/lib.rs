//! # fusekit-nn
//!
//! Fused RMS normalization as a differentiable op, plus the layers built
//! on it.

pub mod bridge;
pub mod module;
pub mod rms_norm;

pub use bridge::RmsNormBridge;
pub use module::Module;
pub use rms_norm::{RmsNorm, DEFAULT_EPS};
