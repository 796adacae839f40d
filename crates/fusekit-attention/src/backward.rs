//! Saved contexts of the attention bridge.
//!
//! Each call shape records one immutable context struct in forward. The
//! struct doubles as the graph's backward function: it is dropped when a
//! non-retaining backward consumes it or when the output goes away.

use std::sync::Arc;

use fusekit_core::autograd::GradFn;
use fusekit_core::{Device, Generator, Result, RngState, Tensor};
use fusekit_kernels::{AttentionKernels, MhaConfig, VarLenBatch};

/// A fresh generator on `device`, rewound to `state`.
///
/// The caller's generator is never touched; restore errors propagate as-is.
fn replay_generator(device: Device, state: &RngState) -> Result<Generator> {
    let mut rng = Generator::for_device(device);
    rng.set_state(state)?;
    Ok(rng)
}

/// Q, K and V views of a packed tensor along `axis`.
pub(crate) fn unpack(qkv: &Tensor, axis: usize) -> Result<(Tensor, Tensor, Tensor)> {
    Ok((qkv.select(axis, 0)?, qkv.select(axis, 1)?, qkv.select(axis, 2)?))
}

/// Fields every attention context carries.
pub(crate) struct Saved {
    pub kernels: Arc<dyn AttentionKernels>,
    pub out: Tensor,
    pub softmax_lse: Tensor,
    pub rng_state: RngState,
    pub device: Device,
    pub config: MhaConfig,
}

pub(crate) struct MhaQkvPackedBackward {
    pub saved: Saved,
    /// `[batch, seqlen, 3, heads, head_dim]`
    pub qkv: Tensor,
}

impl GradFn for MhaQkvPackedBackward {
    fn apply(&self, dout: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = &self.saved;
        tracing::debug!(variant = "qkvpacked", dims = ?self.qkv.dims(), dropout_p = s.config.dropout_p, "attention backward");
        let mut rng = replay_generator(s.device, &s.rng_state)?;
        let (q, k, v) = unpack(&self.qkv, 2)?;
        let dqkv = self.qkv.zeros_like();
        let (dq, dk, dv) = unpack(&dqkv, 2)?;
        s.kernels
            .mha_bwd(dout, &q, &k, &v, &s.out, &s.softmax_lse, &s.config, &mut rng, &dq, &dk, &dv)?;
        Ok(vec![Some(dqkv)])
    }

    fn name(&self) -> &str {
        "MhaQkvPackedBackward"
    }
}

pub(crate) struct MhaBackward {
    pub saved: Saved,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
}

impl GradFn for MhaBackward {
    fn apply(&self, dout: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = &self.saved;
        tracing::debug!(variant = "separate", q = ?self.q.dims(), k = ?self.k.dims(), dropout_p = s.config.dropout_p, "attention backward");
        let mut rng = replay_generator(s.device, &s.rng_state)?;
        let (dq, dk, dv) = (self.q.zeros_like(), self.k.zeros_like(), self.v.zeros_like());
        s.kernels.mha_bwd(
            dout,
            &self.q,
            &self.k,
            &self.v,
            &s.out,
            &s.softmax_lse,
            &s.config,
            &mut rng,
            &dq,
            &dk,
            &dv,
        )?;
        Ok(vec![Some(dq), Some(dk), Some(dv)])
    }

    fn name(&self) -> &str {
        "MhaBackward"
    }
}

pub(crate) struct MhaVarlenQkvPackedBackward {
    pub saved: Saved,
    /// `[total_tokens, 3, heads, head_dim]`
    pub qkv: Tensor,
    pub batch: VarLenBatch,
}

impl GradFn for MhaVarlenQkvPackedBackward {
    fn apply(&self, dout: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = &self.saved;
        tracing::debug!(
            variant = "varlen_qkvpacked",
            dims = ?self.qkv.dims(),
            batch = self.batch.batch_size(),
            dropout_p = s.config.dropout_p,
            "attention backward"
        );
        let mut rng = replay_generator(s.device, &s.rng_state)?;
        let (q, k, v) = unpack(&self.qkv, 1)?;
        let dqkv = self.qkv.zeros_like();
        let (dq, dk, dv) = unpack(&dqkv, 1)?;
        s.kernels.mha_varlen_bwd(
            dout,
            &q,
            &k,
            &v,
            &s.out,
            &s.softmax_lse,
            &self.batch,
            &s.config,
            &mut rng,
            Some(&dq),
            Some(&dk),
            Some(&dv),
        )?;
        Ok(vec![Some(dqkv)])
    }

    fn name(&self) -> &str {
        "MhaVarlenQkvPackedBackward"
    }
}

pub(crate) struct MhaVarlenBackward {
    pub saved: Saved,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    pub batch: VarLenBatch,
}

impl GradFn for MhaVarlenBackward {
    fn apply(&self, dout: &Tensor) -> Result<Vec<Option<Tensor>>> {
        let s = &self.saved;
        tracing::debug!(
            variant = "varlen",
            q = ?self.q.dims(),
            k = ?self.k.dims(),
            batch = self.batch.batch_size(),
            dropout_p = s.config.dropout_p,
            "attention backward"
        );
        let mut rng = replay_generator(s.device, &s.rng_state)?;
        let (dq, dk, dv) = s.kernels.mha_varlen_bwd(
            dout,
            &self.q,
            &self.k,
            &self.v,
            &s.out,
            &s.softmax_lse,
            &self.batch,
            &s.config,
            &mut rng,
            None,
            None,
            None,
        )?;
        Ok(vec![Some(dq), Some(dk), Some(dv)])
    }

    fn name(&self) -> &str {
        "MhaVarlenBackward"
    }
}
