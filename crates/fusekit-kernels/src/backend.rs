//! Kernel entry-point traits.
//!
//! Every method has a default body that reports the capability as missing,
//! so a backend implements exactly the kernels it has and advertises them
//! through `capabilities()`.

use fusekit_core::{FuseError, Generator, Result, RngState, Tensor};

use crate::capability::{Capability, CapabilitySet};
use crate::varlen::VarLenBatch;

/// Identity shared by all kernel families.
pub trait KernelBackend: Send + Sync {
    /// Human-readable backend name used in errors and logs.
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;
}

fn missing(backend: &str, cap: Capability) -> FuseError {
    FuseError::MissingCapability {
        backend: backend.to_string(),
        capability: cap.name(),
    }
}

/// Scalar settings of one attention call, already resolved.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MhaConfig {
    pub dropout_p: f32,
    pub softmax_scale: f32,
    pub causal: bool,
    /// Whether the kernel should materialize the dropout/softmax matrix.
    pub return_softmax: bool,
}

/// Result of an attention forward kernel.
#[derive(Debug, Clone)]
pub struct AttentionForward {
    /// Attention output, laid out like the query.
    pub out: Tensor,
    /// Log-sum-exp of each softmax row (F32).
    pub softmax_lse: Tensor,
    /// State of the generator before the kernel drew its dropout mask.
    pub rng_state: RngState,
    /// Softmax probabilities with dropped entries negated, when requested.
    pub s_dmask: Option<Tensor>,
}

/// Fixed- and variable-length multi-head attention kernels.
///
/// Fixed-length tensors are `[batch, seqlen, heads, head_dim]`;
/// variable-length tensors are `[total_tokens, heads, head_dim]`. K and V
/// may carry fewer heads than Q as long as they divide Q's head count.
#[allow(clippy::too_many_arguments)]
pub trait AttentionKernels: KernelBackend {
    fn mha_fwd(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _config: &MhaConfig,
        _rng: &mut Generator,
    ) -> Result<AttentionForward> {
        Err(missing(self.name(), Capability::MhaFwd))
    }

    /// Write the gradients of q, k and v into `dq`, `dk` and `dv`.
    ///
    /// The gradient targets may be non-contiguous views of one shared
    /// buffer.
    fn mha_bwd(
        &self,
        _dout: &Tensor,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _out: &Tensor,
        _softmax_lse: &Tensor,
        _config: &MhaConfig,
        _rng: &mut Generator,
        _dq: &Tensor,
        _dk: &Tensor,
        _dv: &Tensor,
    ) -> Result<()> {
        Err(missing(self.name(), Capability::MhaBwd))
    }

    fn mha_varlen_fwd(
        &self,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _batch: &VarLenBatch,
        _config: &MhaConfig,
        _rng: &mut Generator,
    ) -> Result<AttentionForward> {
        Err(missing(self.name(), Capability::MhaVarlenFwd))
    }

    /// Gradients of q, k and v. Provided buffers are written and returned;
    /// absent ones are allocated.
    fn mha_varlen_bwd(
        &self,
        _dout: &Tensor,
        _q: &Tensor,
        _k: &Tensor,
        _v: &Tensor,
        _out: &Tensor,
        _softmax_lse: &Tensor,
        _batch: &VarLenBatch,
        _config: &MhaConfig,
        _rng: &mut Generator,
        _dq: Option<&Tensor>,
        _dk: Option<&Tensor>,
        _dv: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        Err(missing(self.name(), Capability::MhaVarlenBwd))
    }
}

/// Gradients produced by an RMS-norm backward kernel.
#[derive(Debug, Clone)]
pub struct RmsNormGrads {
    pub grad_input: Tensor,
    pub grad_weight: Tensor,
    /// Present exactly when the forward had a bias.
    pub grad_bias: Option<Tensor>,
}

/// RMS normalization kernels.
///
/// `normalized_shape` names the trailing dimensions reduced over; `None`
/// reduces over the last dimension only. `inv_rms` has the input's leading
/// dimensions followed by one `1` per normalized dimension.
#[allow(clippy::too_many_arguments)]
pub trait RmsNormKernels: KernelBackend {
    /// Returns `(output, inv_rms)`.
    fn rms_norm(
        &self,
        _input: &Tensor,
        _normalized_shape: Option<&[usize]>,
        _weight: &Tensor,
        _bias: Option<&Tensor>,
        _eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        Err(missing(self.name(), Capability::RmsNorm))
    }

    fn rms_norm_backward(
        &self,
        _input: &Tensor,
        _grad_output: &Tensor,
        _inv_rms: &Tensor,
        _normalized_shape: Option<&[usize]>,
        _weight: &Tensor,
        _bias: Option<&Tensor>,
        _eps: f64,
    ) -> Result<RmsNormGrads> {
        Err(missing(self.name(), Capability::RmsNormBwd))
    }
}
