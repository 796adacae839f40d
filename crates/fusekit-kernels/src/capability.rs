//! Kernel capability tags.
//!
//! A backend advertises the entry points it actually provides. Bridges
//! check the set once at construction so a missing kernel is a
//! configuration error, never a failure halfway through a training step.

use std::fmt;

use fusekit_core::{FuseError, Result};
use serde::{Deserialize, Serialize};

/// One kernel entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    MhaFwd,
    MhaBwd,
    MhaVarlenFwd,
    MhaVarlenBwd,
    RmsNorm,
    RmsNormBwd,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::MhaFwd,
        Capability::MhaBwd,
        Capability::MhaVarlenFwd,
        Capability::MhaVarlenBwd,
        Capability::RmsNorm,
        Capability::RmsNormBwd,
    ];

    /// Entry points an attention bridge needs.
    pub const ATTENTION: [Capability; 4] = [
        Capability::MhaFwd,
        Capability::MhaBwd,
        Capability::MhaVarlenFwd,
        Capability::MhaVarlenBwd,
    ];

    /// Entry points a normalization bridge needs.
    pub const RMS_NORM: [Capability; 2] = [Capability::RmsNorm, Capability::RmsNormBwd];

    /// Kernel name as exported by extension libraries.
    pub fn name(&self) -> &'static str {
        match self {
            Capability::MhaFwd => "mha_fwd",
            Capability::MhaBwd => "mha_bwd",
            Capability::MhaVarlenFwd => "mha_varlen_fwd",
            Capability::MhaVarlenBwd => "mha_varlen_bwd",
            Capability::RmsNorm => "rms_norm",
            Capability::RmsNormBwd => "rms_norm_backward",
        }
    }

    fn bit(&self) -> u8 {
        1 << (*self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of capabilities provided by a backend.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    bits: u8,
}

impl CapabilitySet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Capability::ALL.iter().copied().collect()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.bits |= cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.bits & cap.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Fail with the first capability in `required` that `backend` lacks.
    pub fn require(&self, backend: &str, required: &[Capability]) -> Result<()> {
        match required.iter().find(|c| !self.contains(**c)) {
            Some(missing) => Err(FuseError::MissingCapability {
                backend: backend.to_string(),
                capability: missing.name(),
            }),
            None => Ok(()),
        }
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|c| c.name())).finish()
    }
}
