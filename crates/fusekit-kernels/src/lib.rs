//! # fusekit-kernels
//!
//! The kernel capability set the fusekit bridges call into.
//!
//! Provides:
//! - Capability tags and eager capability assertion
//! - `AttentionKernels` / `RmsNormKernels` entry-point traits
//! - A runtime-loaded C extension (`libloading`), configured from the environment
//! - A reference CPU backend implementing every capability

pub mod backend;
pub mod capability;
pub mod config;
pub mod cpu;
pub mod extension;
pub mod varlen;

pub use backend::{AttentionForward, AttentionKernels, KernelBackend, MhaConfig, RmsNormGrads, RmsNormKernels};
pub use capability::{Capability, CapabilitySet};
pub use config::{ExtensionConfig, EXTENSION_ENV};
pub use cpu::CpuKernels;
pub use extension::{ExtensionLibrary, EXTENSION_ABI_VERSION};
pub use varlen::{SeqSpan, VarLenBatch};
