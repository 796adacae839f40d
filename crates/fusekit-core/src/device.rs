use std::fmt;

/// Device a tensor or generator is bound to.
///
/// Host tensors live on `Cpu`. Accelerator ordinals identify the
/// device an extension kernel runs on and the generator whose stream it
/// consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
pub enum Device {
    #[default]
    Cpu,
    /// Accelerator with ordinal
    Cuda(usize),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// Accelerator ordinal, `None` for the host.
    pub fn ordinal(&self) -> Option<usize> {
        match self {
            Device::Cpu => None,
            Device::Cuda(idx) => Some(*idx),
        }
    }

    /// Stable integer code used across the C ABI (-1 for the host).
    pub fn abi_code(&self) -> i32 {
        match self {
            Device::Cpu => -1,
            Device::Cuda(idx) => *idx as i32,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}
