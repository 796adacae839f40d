use std::sync::Arc;

use fusekit_core::autograd::{self, GradFn};
use fusekit_core::{FuseError, Generator, Result, Tensor};
use fusekit_kernels::{AttentionForward, AttentionKernels, Capability, VarLenBatch};

use crate::backward::{
    unpack, MhaBackward, MhaQkvPackedBackward, MhaVarlenBackward, MhaVarlenQkvPackedBackward, Saved,
};
use crate::params::{AttentionOutput, AttentionParams};

/// Differentiable multi-head attention over an external kernel set.
///
/// Construction checks every attention capability up front, so a bridge
/// that exists can always run forward and backward. The bridge itself
/// holds no mutable state and can be shared across threads.
///
/// ```
/// use std::sync::Arc;
/// use fusekit_attention::{AttentionBridge, AttentionParams};
/// use fusekit_core::{Device, Generator, Tensor};
/// use fusekit_kernels::CpuKernels;
///
/// let bridge = AttentionBridge::new(Arc::new(CpuKernels::new())).unwrap();
/// let mut qkv = Tensor::randn(&[1, 4, 3, 2, 8], 0);
/// qkv.set_requires_grad(true);
/// let mut rng = Generator::new(Device::Cpu, 42);
///
/// let res = bridge.mha_qkvpacked(&qkv, AttentionParams::default().causal(true), &mut rng).unwrap();
/// assert_eq!(res.out.dims(), &[1, 4, 2, 8]);
/// res.out.backward_with(Tensor::ones(&[1, 4, 2, 8])).unwrap();
/// assert_eq!(qkv.grad().unwrap().dims(), qkv.dims());
/// ```
#[derive(Clone)]
pub struct AttentionBridge {
    kernels: Arc<dyn AttentionKernels>,
}

impl std::fmt::Debug for AttentionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttentionBridge")
            .field("backend", &self.kernels.name())
            .finish()
    }
}

fn check_generator(q: &Tensor, rng: &Generator) -> Result<()> {
    if rng.device() != q.device() {
        return Err(FuseError::DeviceMismatch {
            expected: q.device(),
            got: rng.device(),
        });
    }
    Ok(())
}

fn check_packed(qkv: &Tensor, rank: usize, axis: usize) -> Result<()> {
    if qkv.ndim() != rank || qkv.dims()[axis] != 3 {
        return Err(FuseError::InvalidArgument(format!(
            "packed qkv must have rank {rank} with 3 at axis {axis}, got shape {}",
            qkv.shape()
        )));
    }
    Ok(())
}

fn head_dim(t: &Tensor) -> usize {
    t.dims().last().copied().unwrap_or(0)
}

impl AttentionBridge {
    /// Wrap `kernels`, failing with `MissingCapability` if any attention
    /// entry point is absent.
    pub fn new(kernels: Arc<dyn AttentionKernels>) -> Result<Self> {
        kernels
            .capabilities()
            .require(kernels.name(), &Capability::ATTENTION)?;
        Ok(Self { kernels })
    }

    pub fn backend_name(&self) -> &str {
        self.kernels.name()
    }

    fn saved(&self, fwd: &AttentionForward, q: &Tensor, config: fusekit_kernels::MhaConfig) -> Saved {
        Saved {
            kernels: Arc::clone(&self.kernels),
            out: fwd.out.detach(),
            softmax_lse: fwd.softmax_lse.clone(),
            rng_state: fwd.rng_state,
            device: q.device(),
            config,
        }
    }

    fn finish(
        fwd: AttentionForward,
        params: &AttentionParams,
        backward: impl FnOnce(&AttentionForward) -> Option<(Box<dyn GradFn>, Vec<Tensor>)>,
    ) -> AttentionOutput {
        let node = backward(&fwd);
        let AttentionForward {
            out,
            softmax_lse,
            s_dmask,
            ..
        } = fwd;
        let out = match node {
            Some((grad_fn, inputs)) => {
                let inputs: Vec<&Tensor> = inputs.iter().collect();
                autograd::record_op(out, grad_fn, &inputs)
            }
            None => out,
        };
        AttentionOutput {
            out,
            softmax_lse: params.return_softmax.then_some(softmax_lse),
            s_dmask,
        }
    }

    /// Attention over a packed `[batch, seqlen, 3, heads, head_dim]` tensor.
    pub fn mha_qkvpacked(
        &self,
        qkv: &Tensor,
        params: AttentionParams,
        rng: &mut Generator,
    ) -> Result<AttentionOutput> {
        check_packed(qkv, 5, 2)?;
        check_generator(qkv, rng)?;
        let config = params.resolve(head_dim(qkv));
        tracing::debug!(variant = "qkvpacked", dims = ?qkv.dims(), dropout_p = config.dropout_p, causal = config.causal, "attention forward");

        let (q, k, v) = unpack(qkv, 2)?;
        let fwd = self.kernels.mha_fwd(&q, &k, &v, &config, rng)?;

        Ok(Self::finish(fwd, &params, |fwd| {
            autograd::any_tracks_grad(&[qkv]).then(|| {
                let grad_fn = MhaQkvPackedBackward {
                    saved: self.saved(fwd, qkv, config),
                    qkv: qkv.detach(),
                };
                (Box::new(grad_fn) as Box<dyn GradFn>, vec![qkv.clone()])
            })
        }))
    }

    /// Attention over separate `[batch, seqlen, heads, head_dim]` tensors.
    pub fn mha(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        params: AttentionParams,
        rng: &mut Generator,
    ) -> Result<AttentionOutput> {
        check_generator(q, rng)?;
        let config = params.resolve(head_dim(q));
        tracing::debug!(variant = "separate", q = ?q.dims(), k = ?k.dims(), dropout_p = config.dropout_p, causal = config.causal, "attention forward");

        let fwd = self.kernels.mha_fwd(q, k, v, &config, rng)?;

        Ok(Self::finish(fwd, &params, |fwd| {
            autograd::any_tracks_grad(&[q, k, v]).then(|| {
                let grad_fn = MhaBackward {
                    saved: self.saved(fwd, q, config),
                    q: q.detach(),
                    k: k.detach(),
                    v: v.detach(),
                };
                (Box::new(grad_fn) as Box<dyn GradFn>, vec![q.clone(), k.clone(), v.clone()])
            })
        }))
    }

    /// Attention over a packed ragged batch `[total_tokens, 3, heads, head_dim]`.
    ///
    /// Queries and keys share `cu_seqlens` and `max_seqlen`.
    pub fn mha_varlen_qkvpacked(
        &self,
        qkv: &Tensor,
        cu_seqlens: &Tensor,
        max_seqlen: usize,
        params: AttentionParams,
        rng: &mut Generator,
    ) -> Result<AttentionOutput> {
        check_packed(qkv, 4, 1)?;
        check_generator(qkv, rng)?;
        let batch = VarLenBatch::new(cu_seqlens.clone(), cu_seqlens.clone(), max_seqlen, max_seqlen);
        let config = params.resolve(head_dim(qkv));
        tracing::debug!(
            variant = "varlen_qkvpacked",
            dims = ?qkv.dims(),
            batch = batch.batch_size(),
            max_seqlen,
            dropout_p = config.dropout_p,
            "attention forward"
        );

        let (q, k, v) = unpack(qkv, 1)?;
        let fwd = self.kernels.mha_varlen_fwd(&q, &k, &v, &batch, &config, rng)?;

        Ok(Self::finish(fwd, &params, |fwd| {
            autograd::any_tracks_grad(&[qkv]).then(|| {
                let grad_fn = MhaVarlenQkvPackedBackward {
                    saved: self.saved(fwd, qkv, config),
                    qkv: qkv.detach(),
                    batch,
                };
                (Box::new(grad_fn) as Box<dyn GradFn>, vec![qkv.clone()])
            })
        }))
    }

    /// Attention over separate ragged tensors `[total_tokens, heads, head_dim]`.
    pub fn mha_varlen(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        batch: &VarLenBatch,
        params: AttentionParams,
        rng: &mut Generator,
    ) -> Result<AttentionOutput> {
        check_generator(q, rng)?;
        let config = params.resolve(head_dim(q));
        tracing::debug!(
            variant = "varlen",
            q = ?q.dims(),
            k = ?k.dims(),
            batch = batch.batch_size(),
            dropout_p = config.dropout_p,
            "attention forward"
        );

        let fwd = self.kernels.mha_varlen_fwd(q, k, v, batch, &config, rng)?;

        Ok(Self::finish(fwd, &params, |fwd| {
            autograd::any_tracks_grad(&[q, k, v]).then(|| {
                let grad_fn = MhaVarlenBackward {
                    saved: self.saved(fwd, q, config),
                    q: q.detach(),
                    k: k.detach(),
                    v: v.detach(),
                    batch: batch.clone(),
                };
                (Box::new(grad_fn) as Box<dyn GradFn>, vec![q.clone(), k.clone(), v.clone()])
            })
        }))
    }
}
