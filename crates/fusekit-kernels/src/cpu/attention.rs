//! Reference multi-head attention with dropout.
//!
//! Work is split into independent `(sequence, query head)` pairs processed
//! in parallel. Fixed-length batches are treated as ragged batches whose
//! sequences all have the same length, so both layouts share one code path
//! and one dropout stream order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use fusekit_core::storage::CpuBuffer;
use fusekit_core::{FuseError, Generator, Result, Tensor};

use crate::backend::{AttentionForward, MhaConfig};
use crate::varlen::{SeqSpan, VarLenBatch};

#[derive(Debug, Clone, Copy)]
struct Geometry {
    heads_q: usize,
    heads_k: usize,
    head_dim: usize,
    total_q: usize,
    total_k: usize,
}

impl Geometry {
    fn kv_head(&self, head: usize) -> usize {
        head / (self.heads_q / self.heads_k)
    }

    fn q_at(&self, token: usize, head: usize) -> usize {
        (token * self.heads_q + head) * self.head_dim
    }

    fn k_at(&self, token: usize, head: usize) -> usize {
        (token * self.heads_k + head) * self.head_dim
    }
}

/// Where the log-sum-exp of a softmax row lives.
#[derive(Debug, Clone, Copy)]
enum LseLayout {
    /// `[batch, heads, seqlen_q]`
    Fixed { seqlen_q: usize },
    /// `[heads, total_q]`
    Varlen { total_q: usize },
}

pub(crate) struct Problem {
    geo: Geometry,
    spans: Vec<SeqSpan>,
    lse_layout: LseLayout,
    max_q: usize,
    max_k: usize,
}

impl Problem {
    /// Fixed-length problem from `[batch, seqlen, heads, head_dim]` tensors.
    pub(crate) fn fixed(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Self> {
        check_inputs(q, k, v, 4)?;
        let (b, sq, hq, d) = (q.dims()[0], q.dims()[1], q.dims()[2], q.dims()[3]);
        let kd = k.dims();
        if kd[0] != b || kd[3] != d {
            return Err(FuseError::ShapeMismatch {
                expected: vec![b, kd[1], kd[2], d],
                got: kd.to_vec(),
            });
        }
        let (sk, hk) = (kd[1], kd[2]);
        check_heads(hq, hk)?;
        let spans = (0..b)
            .map(|i| SeqSpan {
                q_start: i * sq,
                q_len: sq,
                k_start: i * sk,
                k_len: sk,
            })
            .collect();
        Ok(Self {
            geo: Geometry {
                heads_q: hq,
                heads_k: hk,
                head_dim: d,
                total_q: b * sq,
                total_k: b * sk,
            },
            spans,
            lse_layout: LseLayout::Fixed { seqlen_q: sq },
            max_q: sq,
            max_k: sk,
        })
    }

    /// Variable-length problem from `[total_tokens, heads, head_dim]` tensors.
    pub(crate) fn varlen(q: &Tensor, k: &Tensor, v: &Tensor, batch: &VarLenBatch) -> Result<Self> {
        check_inputs(q, k, v, 3)?;
        let (tq, hq, d) = (q.dims()[0], q.dims()[1], q.dims()[2]);
        let kd = k.dims();
        if kd[2] != d {
            return Err(FuseError::ShapeMismatch {
                expected: vec![kd[0], kd[1], d],
                got: kd.to_vec(),
            });
        }
        let (tk, hk) = (kd[0], kd[1]);
        check_heads(hq, hk)?;
        let spans = batch.spans(tq, tk)?;
        Ok(Self {
            geo: Geometry {
                heads_q: hq,
                heads_k: hk,
                head_dim: d,
                total_q: tq,
                total_k: tk,
            },
            spans,
            lse_layout: LseLayout::Varlen { total_q: tq },
            max_q: batch.max_seqlen_q,
            max_k: batch.max_seqlen_k,
        })
    }

    fn pairs(&self) -> Vec<(usize, usize)> {
        (0..self.spans.len())
            .flat_map(|seq| (0..self.geo.heads_q).map(move |head| (seq, head)))
            .collect()
    }

    fn lse_index(&self, seq: usize, head: usize, row: usize) -> usize {
        match self.lse_layout {
            LseLayout::Fixed { seqlen_q } => (seq * self.geo.heads_q + head) * seqlen_q + row,
            LseLayout::Varlen { total_q } => head * total_q + self.spans[seq].q_start + row,
        }
    }

    fn lse_dims(&self) -> Vec<usize> {
        match self.lse_layout {
            LseLayout::Fixed { seqlen_q } => vec![self.spans.len(), self.geo.heads_q, seqlen_q],
            LseLayout::Varlen { total_q } => vec![self.geo.heads_q, total_q],
        }
    }

    fn mask_index(&self, seq: usize, head: usize, row: usize, col: usize) -> usize {
        ((seq * self.geo.heads_q + head) * self.max_q + row) * self.max_k + col
    }

    fn mask_dims(&self) -> Vec<usize> {
        vec![self.spans.len(), self.geo.heads_q, self.max_q, self.max_k]
    }

    /// Number of dropout draws one call consumes.
    fn dropout_draws(&self) -> u64 {
        let per_head: usize = self.spans.iter().map(|s| s.q_len * s.k_len).sum();
        (per_head * self.geo.heads_q) as u64
    }
}

fn check_inputs(q: &Tensor, k: &Tensor, v: &Tensor, rank: usize) -> Result<()> {
    for t in [q, k, v] {
        if t.ndim() != rank {
            return Err(FuseError::InvalidArgument(format!(
                "attention inputs must have rank {rank}, got shape {}",
                t.shape()
            )));
        }
    }
    if !q.dtype().is_float() {
        return Err(FuseError::UnsupportedDType(q.dtype()));
    }
    for t in [k, v] {
        if t.dtype() != q.dtype() {
            return Err(FuseError::DTypeMismatch {
                expected: q.dtype(),
                got: t.dtype(),
            });
        }
    }
    if v.dims() != k.dims() {
        return Err(FuseError::ShapeMismatch {
            expected: k.dims().to_vec(),
            got: v.dims().to_vec(),
        });
    }
    Ok(())
}

fn check_heads(heads_q: usize, heads_k: usize) -> Result<()> {
    if heads_k == 0 || heads_q % heads_k != 0 {
        return Err(FuseError::InvalidArgument(format!(
            "key/value heads ({heads_k}) must divide query heads ({heads_q})"
        )));
    }
    Ok(())
}

fn check_dropout(p: f32) -> Result<()> {
    if !(0.0..1.0).contains(&p) {
        return Err(FuseError::InvalidArgument(format!(
            "dropout probability must be in [0, 1), got {p}"
        )));
    }
    Ok(())
}

fn check_dims(name: &str, t: &Tensor, expected: &[usize]) -> Result<()> {
    if t.dims() != expected {
        tracing::debug!(tensor = name, "attention operand has the wrong shape");
        return Err(FuseError::ShapeMismatch {
            expected: expected.to_vec(),
            got: t.dims().to_vec(),
        });
    }
    Ok(())
}

/// One seed per `(sequence, head)` pair, in pair order.
///
/// Without dropout the generator is left untouched.
fn dropout_seeds(rng: &mut Generator, problem: &Problem, n_pairs: usize, p: f32) -> Vec<u64> {
    if p == 0.0 {
        return vec![0; n_pairs];
    }
    let mut stream = rng.stream(problem.dropout_draws());
    (0..n_pairs).map(|_| stream.gen::<u64>()).collect()
}

/// Dropout multipliers for a `rows x cols` block: `1 / (1 - p)` where kept.
fn dropout_scales(seed: u64, rows: usize, cols: usize, p: f32) -> Vec<f64> {
    if p == 0.0 {
        return vec![1.0; rows * cols];
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let keep_scale = 1.0 / (1.0 - p as f64);
    (0..rows * cols)
        .map(|_| if rng.gen::<f32>() >= p { keep_scale } else { 0.0 })
        .collect()
}

fn is_masked(causal: bool, row: usize, col: usize, span: &SeqSpan) -> bool {
    // bottom-right aligned: the last query sees every key
    causal && col as isize > row as isize + span.k_len as isize - span.q_len as isize
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

struct Operands {
    q: Vec<f64>,
    k: Vec<f64>,
    v: Vec<f64>,
}

impl Operands {
    fn read(q: &Tensor, k: &Tensor, v: &Tensor) -> Self {
        Self {
            q: q.to_vec_f64(),
            k: k.to_vec_f64(),
            v: v.to_vec_f64(),
        }
    }
}

struct PairForward {
    out: Vec<f64>,
    lse: Vec<f64>,
    probs: Option<Vec<f64>>,
}

fn forward_pair(
    ops: &Operands,
    geo: &Geometry,
    span: &SeqSpan,
    head: usize,
    config: &MhaConfig,
    seed: u64,
) -> PairForward {
    let d = geo.head_dim;
    let kv_head = geo.kv_head(head);
    let scale = config.softmax_scale as f64;
    let drop = dropout_scales(seed, span.q_len, span.k_len, config.dropout_p);

    let mut out = vec![0.0; span.q_len * d];
    let mut lse = vec![f64::NEG_INFINITY; span.q_len];
    let mut probs = config.return_softmax.then(|| vec![0.0; span.q_len * span.k_len]);
    let mut scores = vec![f64::NEG_INFINITY; span.k_len];

    for i in 0..span.q_len {
        let qi = &ops.q[geo.q_at(span.q_start + i, head)..][..d];
        let mut row_max = f64::NEG_INFINITY;
        for (j, score) in scores.iter_mut().enumerate() {
            *score = if is_masked(config.causal, i, j, span) {
                f64::NEG_INFINITY
            } else {
                let kj = &ops.k[geo.k_at(span.k_start + j, kv_head)..][..d];
                scale * dot(qi, kj)
            };
            row_max = row_max.max(*score);
        }
        if row_max == f64::NEG_INFINITY {
            continue;
        }
        let sum: f64 = scores.iter().map(|s| (s - row_max).exp()).sum();
        let row_lse = row_max + sum.ln();
        lse[i] = row_lse;

        let out_i = &mut out[i * d..(i + 1) * d];
        for (j, score) in scores.iter().enumerate() {
            let p = (score - row_lse).exp();
            let keep = drop[i * span.k_len + j];
            if let Some(probs) = probs.as_mut() {
                probs[i * span.k_len + j] = if keep > 0.0 { p } else { -p };
            }
            if p == 0.0 || keep == 0.0 {
                continue;
            }
            let vj = &ops.v[geo.k_at(span.k_start + j, kv_head)..][..d];
            for (o, &x) in out_i.iter_mut().zip(vj) {
                *o += p * keep * x;
            }
        }
    }

    PairForward { out, lse, probs }
}

pub(crate) fn forward(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    problem: &Problem,
    config: &MhaConfig,
    rng: &mut Generator,
) -> Result<AttentionForward> {
    check_dropout(config.dropout_p)?;
    let geo = problem.geo;
    let pairs = problem.pairs();
    let rng_state = rng.get_state();
    let seeds = dropout_seeds(rng, problem, pairs.len(), config.dropout_p);
    let ops = Operands::read(q, k, v);

    let results: Vec<PairForward> = pairs
        .par_iter()
        .zip(seeds.par_iter())
        .map(|(&(seq, head), &seed)| forward_pair(&ops, &geo, &problem.spans[seq], head, config, seed))
        .collect();

    let mut out = vec![0.0f64; geo.total_q * geo.heads_q * geo.head_dim];
    let mut lse = vec![f32::NEG_INFINITY; geo.heads_q * geo.total_q];
    let mut mask = config
        .return_softmax
        .then(|| vec![0.0f32; problem.mask_dims().iter().product()]);

    for (&(seq, head), pair) in pairs.iter().zip(&results) {
        let span = &problem.spans[seq];
        for i in 0..span.q_len {
            let dst = geo.q_at(span.q_start + i, head);
            out[dst..dst + geo.head_dim].copy_from_slice(&pair.out[i * geo.head_dim..(i + 1) * geo.head_dim]);
            lse[problem.lse_index(seq, head, i)] = pair.lse[i] as f32;
        }
        if let (Some(mask), Some(probs)) = (mask.as_mut(), pair.probs.as_ref()) {
            for i in 0..span.q_len {
                for j in 0..span.k_len {
                    mask[problem.mask_index(seq, head, i, j)] = probs[i * span.k_len + j] as f32;
                }
            }
        }
    }

    let out = Tensor::from_buffer(CpuBuffer::F64(out), q.dims())?.to_dtype(q.dtype());
    let softmax_lse = Tensor::from_buffer(CpuBuffer::F32(lse), &problem.lse_dims())?;
    let s_dmask = mask
        .map(|m| Tensor::from_buffer(CpuBuffer::F32(m), &problem.mask_dims()))
        .transpose()?;

    Ok(AttentionForward {
        out,
        softmax_lse,
        rng_state,
        s_dmask,
    })
}

struct PairGrads {
    dq: Vec<f64>,
    dk: Vec<f64>,
    dv: Vec<f64>,
}

#[allow(clippy::too_many_arguments)]
fn backward_pair(
    ops: &Operands,
    dout: &[f64],
    out: &[f64],
    lse: &[f32],
    problem: &Problem,
    seq: usize,
    head: usize,
    config: &MhaConfig,
    seed: u64,
) -> PairGrads {
    let geo = &problem.geo;
    let span = &problem.spans[seq];
    let d = geo.head_dim;
    let kv_head = geo.kv_head(head);
    let scale = config.softmax_scale as f64;
    let drop = dropout_scales(seed, span.q_len, span.k_len, config.dropout_p);

    let mut dq = vec![0.0; span.q_len * d];
    let mut dk = vec![0.0; span.k_len * d];
    let mut dv = vec![0.0; span.k_len * d];

    for i in 0..span.q_len {
        let row_lse = lse[problem.lse_index(seq, head, i)] as f64;
        if row_lse == f64::NEG_INFINITY {
            continue;
        }
        let at = geo.q_at(span.q_start + i, head);
        let qi = &ops.q[at..at + d];
        let do_i = &dout[at..at + d];
        let delta = dot(do_i, &out[at..at + d]);

        for j in 0..span.k_len {
            if is_masked(config.causal, i, j, span) {
                continue;
            }
            let kt = geo.k_at(span.k_start + j, kv_head);
            let kj = &ops.k[kt..kt + d];
            let vj = &ops.v[kt..kt + d];
            let p = (scale * dot(qi, kj) - row_lse).exp();
            let keep = drop[i * span.k_len + j];

            let dp = dot(do_i, vj) * keep;
            let ds = p * (dp - delta);
            let pd = p * keep;
            for c in 0..d {
                dv[j * d + c] += pd * do_i[c];
                dq[i * d + c] += scale * ds * kj[c];
                dk[j * d + c] += scale * ds * qi[c];
            }
        }
    }

    PairGrads { dq, dk, dv }
}

/// Gradients laid out like q, k and v (contiguous, f64).
#[allow(clippy::too_many_arguments)]
pub(crate) fn backward(
    dout: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    out: &Tensor,
    softmax_lse: &Tensor,
    problem: &Problem,
    config: &MhaConfig,
    rng: &mut Generator,
) -> Result<(Tensor, Tensor, Tensor)> {
    check_dropout(config.dropout_p)?;
    check_dims("dout", dout, q.dims())?;
    check_dims("out", out, q.dims())?;
    check_dims("softmax_lse", softmax_lse, &problem.lse_dims())?;

    let geo = problem.geo;
    let pairs = problem.pairs();
    let seeds = dropout_seeds(rng, problem, pairs.len(), config.dropout_p);
    let ops = Operands::read(q, k, v);
    let dout_v = dout.to_vec_f64();
    let out_v = out.to_vec_f64();
    let lse_v = softmax_lse.to_vec_f32();

    let results: Vec<PairGrads> = pairs
        .par_iter()
        .zip(seeds.par_iter())
        .map(|(&(seq, head), &seed)| {
            backward_pair(&ops, &dout_v, &out_v, &lse_v, problem, seq, head, config, seed)
        })
        .collect();

    let d = geo.head_dim;
    let mut dq = vec![0.0f64; geo.total_q * geo.heads_q * d];
    let mut dk = vec![0.0f64; geo.total_k * geo.heads_k * d];
    let mut dv = vec![0.0f64; geo.total_k * geo.heads_k * d];

    // kv heads shared by a query-head group accumulate in pair order
    for (&(seq, head), grads) in pairs.iter().zip(&results) {
        let span = &problem.spans[seq];
        let kv_head = geo.kv_head(head);
        for i in 0..span.q_len {
            let dst = geo.q_at(span.q_start + i, head);
            dq[dst..dst + d].copy_from_slice(&grads.dq[i * d..(i + 1) * d]);
        }
        for j in 0..span.k_len {
            let dst = geo.k_at(span.k_start + j, kv_head);
            for c in 0..d {
                dk[dst + c] += grads.dk[j * d + c];
                dv[dst + c] += grads.dv[j * d + c];
            }
        }
    }

    Ok((
        Tensor::from_buffer(CpuBuffer::F64(dq), q.dims())?,
        Tensor::from_buffer(CpuBuffer::F64(dk), k.dims())?,
        Tensor::from_buffer(CpuBuffer::F64(dv), v.dims())?,
    ))
}
