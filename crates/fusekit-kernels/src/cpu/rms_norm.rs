//! Reference RMS normalization.
//!
//! Forward: `y = x * inv_rms * weight + bias`, with
//! `inv_rms = 1 / sqrt(mean(x^2) + eps)` over the normalized dimensions.
//! Backward computes `dx`, `dweight` and `dbias` in a single pass per row.

use rayon::prelude::*;

use fusekit_core::storage::CpuBuffer;
use fusekit_core::{FuseError, Result, Tensor};

use crate::backend::RmsNormGrads;

struct RowLayout {
    rows: usize,
    cols: usize,
    stat_dims: Vec<usize>,
}

fn row_layout(input: &Tensor, normalized_shape: Option<&[usize]>) -> Result<RowLayout> {
    if !input.dtype().is_float() {
        return Err(FuseError::UnsupportedDType(input.dtype()));
    }
    let rank = match normalized_shape {
        Some(shape) => {
            if !input.shape().ends_with(shape) {
                return Err(FuseError::ShapeMismatch {
                    expected: shape.to_vec(),
                    got: input.dims().to_vec(),
                });
            }
            shape.len()
        }
        None => 1,
    };
    let (rows, cols) = input.shape().rows_and_cols(rank).ok_or(FuseError::InvalidAxis {
        axis: rank,
        ndim: input.ndim(),
    })?;
    let mut stat_dims = input.dims()[..input.ndim() - rank].to_vec();
    stat_dims.extend(std::iter::repeat(1).take(rank));
    Ok(RowLayout { rows, cols, stat_dims })
}

fn check_param(name: &str, param: &Tensor, cols: usize) -> Result<()> {
    if param.numel() != cols {
        return Err(FuseError::ShapeMismatch {
            expected: vec![cols],
            got: param.dims().to_vec(),
        });
    }
    if !param.dtype().is_float() {
        tracing::debug!(param = name, "non-float normalization parameter");
        return Err(FuseError::UnsupportedDType(param.dtype()));
    }
    Ok(())
}

fn tensor_like(data: Vec<f64>, dims: &[usize], like: &Tensor) -> Result<Tensor> {
    Ok(Tensor::from_buffer(CpuBuffer::F64(data), dims)?.to_dtype(like.dtype()))
}

pub(crate) fn forward(
    input: &Tensor,
    normalized_shape: Option<&[usize]>,
    weight: &Tensor,
    bias: Option<&Tensor>,
    eps: f64,
) -> Result<(Tensor, Tensor)> {
    let layout = row_layout(input, normalized_shape)?;
    let cols = layout.cols;
    check_param("weight", weight, cols)?;
    if let Some(bias) = bias {
        check_param("bias", bias, cols)?;
    }

    let x = input.to_vec_f64();
    let w = weight.to_vec_f64();
    let b = bias.map(|t| t.to_vec_f64());

    let mut out = vec![0.0f64; layout.rows * cols];
    let mut inv_rms = vec![0.0f64; layout.rows];
    if cols > 0 {
        out.par_chunks_mut(cols)
            .zip(inv_rms.par_iter_mut())
            .zip(x.par_chunks(cols))
            .for_each(|((y, inv), x)| {
                let mean_sq = x.iter().map(|v| v * v).sum::<f64>() / cols as f64;
                *inv = 1.0 / (mean_sq + eps).sqrt();
                for i in 0..cols {
                    y[i] = x[i] * *inv * w[i] + b.as_ref().map_or(0.0, |b| b[i]);
                }
            });
    }

    Ok((
        tensor_like(out, input.dims(), input)?,
        tensor_like(inv_rms, &layout.stat_dims, input)?,
    ))
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn backward(
    input: &Tensor,
    grad_output: &Tensor,
    inv_rms: &Tensor,
    normalized_shape: Option<&[usize]>,
    weight: &Tensor,
    bias: Option<&Tensor>,
    _eps: f64,
) -> Result<RmsNormGrads> {
    let layout = row_layout(input, normalized_shape)?;
    let cols = layout.cols;
    check_param("weight", weight, cols)?;
    if grad_output.dims() != input.dims() {
        return Err(FuseError::ShapeMismatch {
            expected: input.dims().to_vec(),
            got: grad_output.dims().to_vec(),
        });
    }
    if inv_rms.numel() != layout.rows {
        return Err(FuseError::ShapeMismatch {
            expected: layout.stat_dims.clone(),
            got: inv_rms.dims().to_vec(),
        });
    }

    let x = input.to_vec_f64();
    let go = grad_output.to_vec_f64();
    let inv = inv_rms.to_vec_f64();
    let w = weight.to_vec_f64();

    let mut dx = vec![0.0f64; layout.rows * cols];
    let mut dw = vec![0.0f64; cols];
    let mut db = vec![0.0f64; cols];

    if cols > 0 {
        dx.par_chunks_mut(cols)
            .zip(x.par_chunks(cols))
            .zip(go.par_chunks(cols))
            .zip(inv.par_iter())
            .for_each(|(((dx, x), go), &inv)| {
                // d/dx[x * inv * w] = w * inv * go - x * inv^3 * mean(x * go * w)
                let dot: f64 = (0..cols).map(|i| x[i] * go[i] * w[i]).sum();
                let coeff = dot * inv * inv * inv / cols as f64;
                for i in 0..cols {
                    dx[i] = w[i] * inv * go[i] - coeff * x[i];
                }
            });

        // parameter gradients reduce over rows in order
        for ((x, go), &inv) in x.chunks(cols).zip(go.chunks(cols)).zip(inv.iter()) {
            for i in 0..cols {
                dw[i] += go[i] * x[i] * inv;
                db[i] += go[i];
            }
        }
    }

    Ok(RmsNormGrads {
        grad_input: tensor_like(dx, input.dims(), input)?,
        grad_weight: tensor_like(dw, weight.dims(), weight)?,
        grad_bias: bias.map(|b| tensor_like(db, b.dims(), b)).transpose()?,
    })
}
