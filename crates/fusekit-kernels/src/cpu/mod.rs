//! In-process reference backend.
//!
//! Plain f64 loops parallelised with rayon over independent rows or
//! `(sequence, head)` pairs. It implements every capability and is what
//! the bridge test suites run against when no extension is loaded.

mod attention;
mod rms_norm;

use fusekit_core::{Generator, Result, Tensor};

use crate::backend::{AttentionForward, AttentionKernels, KernelBackend, MhaConfig, RmsNormGrads, RmsNormKernels};
use crate::capability::CapabilitySet;
use crate::varlen::VarLenBatch;
use attention::Problem;

/// Reference CPU kernels.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuKernels;

impl CpuKernels {
    pub fn new() -> Self {
        Self
    }
}

impl KernelBackend for CpuKernels {
    fn name(&self) -> &str {
        "cpu-reference"
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::all()
    }
}

impl AttentionKernels for CpuKernels {
    fn mha_fwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &MhaConfig,
        rng: &mut Generator,
    ) -> Result<AttentionForward> {
        let problem = Problem::fixed(q, k, v)?;
        attention::forward(q, k, v, &problem, config, rng)
    }

    fn mha_bwd(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        softmax_lse: &Tensor,
        config: &MhaConfig,
        rng: &mut Generator,
        dq: &Tensor,
        dk: &Tensor,
        dv: &Tensor,
    ) -> Result<()> {
        let problem = Problem::fixed(q, k, v)?;
        let (gq, gk, gv) = attention::backward(dout, q, k, v, out, softmax_lse, &problem, config, rng)?;
        dq.copy_from(&gq)?;
        dk.copy_from(&gk)?;
        dv.copy_from(&gv)
    }

    fn mha_varlen_fwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &VarLenBatch,
        config: &MhaConfig,
        rng: &mut Generator,
    ) -> Result<AttentionForward> {
        let problem = Problem::varlen(q, k, v, batch)?;
        attention::forward(q, k, v, &problem, config, rng)
    }

    fn mha_varlen_bwd(
        &self,
        dout: &Tensor,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        out: &Tensor,
        softmax_lse: &Tensor,
        batch: &VarLenBatch,
        config: &MhaConfig,
        rng: &mut Generator,
        dq: Option<&Tensor>,
        dk: Option<&Tensor>,
        dv: Option<&Tensor>,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let problem = Problem::varlen(q, k, v, batch)?;
        let (gq, gk, gv) = attention::backward(dout, q, k, v, out, softmax_lse, &problem, config, rng)?;
        Ok((
            fill_or_cast(dq, gq, q)?,
            fill_or_cast(dk, gk, k)?,
            fill_or_cast(dv, gv, v)?,
        ))
    }
}

/// Write `grad` into the caller's buffer, or hand it back in `like`'s dtype.
fn fill_or_cast(target: Option<&Tensor>, grad: Tensor, like: &Tensor) -> Result<Tensor> {
    match target {
        Some(buf) => {
            buf.copy_from(&grad)?;
            Ok(buf.clone())
        }
        None => Ok(grad.to_dtype(like.dtype())),
    }
}

impl RmsNormKernels for CpuKernels {
    fn rms_norm(
        &self,
        input: &Tensor,
        normalized_shape: Option<&[usize]>,
        weight: &Tensor,
        bias: Option<&Tensor>,
        eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        rms_norm::forward(input, normalized_shape, weight, bias, eps)
    }

    fn rms_norm_backward(
        &self,
        input: &Tensor,
        grad_output: &Tensor,
        inv_rms: &Tensor,
        normalized_shape: Option<&[usize]>,
        weight: &Tensor,
        bias: Option<&Tensor>,
        eps: f64,
    ) -> Result<RmsNormGrads> {
        rms_norm::backward(input, grad_output, inv_rms, normalized_shape, weight, bias, eps)
    }
}
