use fusekit_core::{DType, FuseError, Result, Tensor};

/// Ragged batch described by cumulative sequence offsets.
///
/// Sequence `i` of the query stream occupies tokens
/// `cu_seqlens_q[i]..cu_seqlens_q[i + 1]`, and likewise for keys.
#[derive(Debug, Clone)]
pub struct VarLenBatch {
    pub cu_seqlens_q: Tensor,
    pub cu_seqlens_k: Tensor,
    pub max_seqlen_q: usize,
    pub max_seqlen_k: usize,
}

/// Token ranges of one sequence in both streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpan {
    pub q_start: usize,
    pub q_len: usize,
    pub k_start: usize,
    pub k_len: usize,
}

impl VarLenBatch {
    pub fn new(cu_seqlens_q: Tensor, cu_seqlens_k: Tensor, max_seqlen_q: usize, max_seqlen_k: usize) -> Self {
        Self {
            cu_seqlens_q,
            cu_seqlens_k,
            max_seqlen_q,
            max_seqlen_k,
        }
    }

    /// Build offsets from per-sequence lengths.
    pub fn from_seqlens(q_lens: &[usize], k_lens: &[usize]) -> Result<Self> {
        if q_lens.len() != k_lens.len() {
            return Err(FuseError::ShapeMismatch {
                expected: vec![q_lens.len()],
                got: vec![k_lens.len()],
            });
        }
        Ok(Self {
            cu_seqlens_q: cumulative(q_lens)?,
            cu_seqlens_k: cumulative(k_lens)?,
            max_seqlen_q: q_lens.iter().copied().max().unwrap_or(0),
            max_seqlen_k: k_lens.iter().copied().max().unwrap_or(0),
        })
    }

    /// Batch of one sequence of `seqlen_q` queries and `seqlen_k` keys.
    pub fn single(seqlen_q: usize, seqlen_k: usize) -> Result<Self> {
        Self::from_seqlens(&[seqlen_q], &[seqlen_k])
    }

    pub fn batch_size(&self) -> usize {
        self.cu_seqlens_q.numel().saturating_sub(1)
    }

    /// Check the offsets against the token counts of both streams.
    pub fn validate(&self, total_q: usize, total_k: usize) -> Result<()> {
        self.spans(total_q, total_k).map(|_| ())
    }

    /// Per-sequence token ranges, validated.
    pub fn spans(&self, total_q: usize, total_k: usize) -> Result<Vec<SeqSpan>> {
        let cu_q = offsets(&self.cu_seqlens_q, total_q, self.max_seqlen_q, "cu_seqlens_q")?;
        let cu_k = offsets(&self.cu_seqlens_k, total_k, self.max_seqlen_k, "cu_seqlens_k")?;
        if cu_q.len() != cu_k.len() {
            return Err(FuseError::ShapeMismatch {
                expected: vec![cu_q.len()],
                got: vec![cu_k.len()],
            });
        }
        Ok(cu_q
            .windows(2)
            .zip(cu_k.windows(2))
            .map(|(q, k)| SeqSpan {
                q_start: q[0],
                q_len: q[1] - q[0],
                k_start: k[0],
                k_len: k[1] - k[0],
            })
            .collect())
    }
}

fn cumulative(lens: &[usize]) -> Result<Tensor> {
    let mut cu = Vec::with_capacity(lens.len() + 1);
    let mut total: i32 = 0;
    cu.push(0);
    for &len in lens {
        let len = i32::try_from(len)
            .map_err(|_| FuseError::InvalidArgument(format!("sequence length {len} overflows i32")))?;
        total = total
            .checked_add(len)
            .ok_or_else(|| FuseError::InvalidArgument("total token count overflows i32".into()))?;
        cu.push(total);
    }
    let n = cu.len();
    Ok(Tensor::from_i32(&cu, &[n]))
}

fn offsets(cu: &Tensor, total: usize, max_len: usize, what: &str) -> Result<Vec<usize>> {
    if !matches!(cu.dtype(), DType::I32 | DType::I64) {
        return Err(FuseError::DTypeMismatch {
            expected: DType::I32,
            got: cu.dtype(),
        });
    }
    if cu.ndim() != 1 || cu.numel() < 2 {
        return Err(FuseError::InvalidArgument(format!(
            "{what} must be 1-D with at least two entries, got shape {}",
            cu.shape()
        )));
    }
    let raw = cu.to_vec_i64();
    if raw[0] != 0 {
        return Err(FuseError::InvalidArgument(format!("{what} must start at 0, got {}", raw[0])));
    }
    let mut out = Vec::with_capacity(raw.len());
    for pair in raw.windows(2) {
        if pair[1] < pair[0] {
            return Err(FuseError::InvalidArgument(format!("{what} must be non-decreasing")));
        }
        if (pair[1] - pair[0]) as usize > max_len {
            return Err(FuseError::InvalidArgument(format!(
                "{what} has a sequence of length {} above the declared maximum {max_len}",
                pair[1] - pair[0]
            )));
        }
    }
    out.extend(raw.iter().map(|&v| v as usize));
    if out.last().copied() != Some(total) {
        return Err(FuseError::InvalidArgument(format!(
            "{what} ends at {:?} but the tensor holds {total} tokens",
            out.last()
        )));
    }
    Ok(out)
}
