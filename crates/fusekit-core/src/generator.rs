//! Device-bound pseudorandom generator with replayable state.
//!
//! Kernels never keep their own random state. A stochastic kernel asks the
//! generator for a counter-based stream (`stream`), which reserves a window
//! of the sequence by bumping the offset. Capturing `get_state()` before the
//! call and restoring it later with `set_state` therefore reproduces the
//! exact same window, bit for bit.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::{Device, FuseError, Result};

/// Opaque snapshot of a `Generator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RngState {
    pub device: Device,
    pub seed: u64,
    pub offset: u64,
}

/// Counter-based generator bound to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generator {
    device: Device,
    seed: u64,
    offset: u64,
}

impl Generator {
    pub fn new(device: Device, seed: u64) -> Self {
        Self {
            device,
            seed,
            offset: 0,
        }
    }

    /// Generator for `device` with seed 0, the state a backward pass starts
    /// from before restoring a snapshot.
    pub fn for_device(device: Device) -> Self {
        Self::new(device, 0)
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn manual_seed(&mut self, seed: u64) {
        self.seed = seed;
        self.offset = 0;
    }

    pub fn get_state(&self) -> RngState {
        RngState {
            device: self.device,
            seed: self.seed,
            offset: self.offset,
        }
    }

    /// Reinstate a snapshot. The snapshot must come from a generator bound
    /// to the same device.
    pub fn set_state(&mut self, state: &RngState) -> Result<()> {
        if state.device != self.device {
            return Err(FuseError::RngStateMismatch {
                generator: self.device,
                state: state.device,
            });
        }
        self.seed = state.seed;
        self.offset = state.offset;
        Ok(())
    }

    /// Reserve `increment` draws and return the stream that covers them.
    ///
    /// The stream is keyed by `(seed, offset)` at the time of the call, so
    /// two generators in the same state hand out identical streams.
    pub fn stream(&mut self, increment: u64) -> StdRng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&self.seed.to_le_bytes());
        key[8..16].copy_from_slice(&self.offset.to_le_bytes());
        self.offset = self.offset.wrapping_add(increment);
        StdRng::from_seed(key)
    }
}
