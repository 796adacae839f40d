//! Runtime-loaded kernel extension via dlopen.
//!
//! The extension is a shared library exporting plain C entry points. Only
//! `fusekit_abi_version` is mandatory; every kernel symbol the library
//! exports adds the matching capability. Tensors cross the boundary as
//! `TensorDesc` values pointing into host storage owned by Rust, and every
//! output buffer is allocated on this side before the call.

use std::ffi::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::ptr;

use libloading::Library;

use fusekit_core::{DType, FuseError, Generator, Result, RngState, Tensor};

use crate::backend::{AttentionForward, AttentionKernels, KernelBackend, MhaConfig, RmsNormGrads, RmsNormKernels};
use crate::capability::{Capability, CapabilitySet};
use crate::config::ExtensionConfig;
use crate::varlen::VarLenBatch;

/// ABI revision this crate speaks. Bumped on any descriptor or signature change.
pub const EXTENSION_ABI_VERSION: u32 = 1;

/// Highest tensor rank a descriptor can carry.
pub const MAX_RANK: usize = 8;

// ---------------------------------------------------------------------------
// Boundary types
// ---------------------------------------------------------------------------

/// Strided view handed to extension kernels. Shape and strides are in
/// elements; `data` already includes the view's offset.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TensorDesc {
    pub data: *mut c_void,
    pub dtype: c_int,
    pub device: c_int,
    pub ndim: c_int,
    pub shape: [i64; MAX_RANK],
    pub strides: [i64; MAX_RANK],
}

impl TensorDesc {
    pub fn new(t: &Tensor) -> Result<Self> {
        if t.ndim() > MAX_RANK {
            return Err(FuseError::InvalidArgument(format!(
                "rank {} exceeds the extension limit of {MAX_RANK}",
                t.ndim()
            )));
        }
        let mut shape = [0i64; MAX_RANK];
        let mut strides = [0i64; MAX_RANK];
        for (i, (&d, &s)) in t.dims().iter().zip(t.strides()).enumerate() {
            shape[i] = d as i64;
            strides[i] = s as i64;
        }
        let byte_offset = t.offset() * t.dtype().size_in_bytes();
        // The pointer is only dereferenced by the extension during a call
        // that borrows `t`, with no storage guard held.
        let data = unsafe { (t.storage().raw_ptr() as *mut u8).add(byte_offset) as *mut c_void };
        Ok(Self {
            data,
            dtype: t.dtype().abi_code(),
            device: t.device().abi_code(),
            ndim: t.ndim() as c_int,
            shape,
            strides,
        })
    }
}

/// Scalar arguments shared by the attention entry points.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MhaScalars {
    pub dropout_p: f32,
    pub softmax_scale: f32,
    pub causal: c_int,
    pub return_softmax: c_int,
    pub seed: u64,
    pub offset: u64,
}

type FnAbiVersion = unsafe extern "C" fn() -> u32;

type FnMhaFwd = unsafe extern "C" fn(
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // q, k, v
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // out, lse, s_dmask (nullable)
    *const MhaScalars,
) -> c_int;

type FnMhaBwd = unsafe extern "C" fn(
    *const TensorDesc,                                       // dout
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // q, k, v
    *const TensorDesc, *const TensorDesc,                    // out, lse
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // dq, dk, dv
    *const MhaScalars,
) -> c_int;

type FnMhaVarlenFwd = unsafe extern "C" fn(
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // q, k, v
    *const TensorDesc, *const TensorDesc,                    // cu_seqlens_q, cu_seqlens_k
    i64, i64,                                                // max_seqlen_q, max_seqlen_k
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // out, lse, s_dmask (nullable)
    *const MhaScalars,
) -> c_int;

type FnMhaVarlenBwd = unsafe extern "C" fn(
    *const TensorDesc,                                       // dout
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // q, k, v
    *const TensorDesc, *const TensorDesc,                    // out, lse
    *const TensorDesc, *const TensorDesc,                    // cu_seqlens_q, cu_seqlens_k
    i64, i64,                                                // max_seqlen_q, max_seqlen_k
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // dq, dk, dv
    *const MhaScalars,
) -> c_int;

type FnRmsNorm = unsafe extern "C" fn(
    *const TensorDesc,            // input
    *const i64, c_int,            // normalized shape, rank (-1 = last dim)
    *const TensorDesc,            // weight
    *const TensorDesc,            // bias (nullable)
    *const TensorDesc,            // out
    *const TensorDesc,            // inv_rms
    f64,                          // eps
) -> c_int;

type FnRmsNormBwd = unsafe extern "C" fn(
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // input, grad_out, inv_rms
    *const i64, c_int,                                       // normalized shape, rank
    *const TensorDesc, *const TensorDesc,                    // weight, bias (nullable)
    *const TensorDesc, *const TensorDesc, *const TensorDesc, // grad_input, grad_weight, grad_bias (nullable)
    f64,
) -> c_int;

fn check(op: &'static str, code: c_int) -> Result<()> {
    if code == 0 {
        Ok(())
    } else {
        Err(FuseError::Kernel { op, code })
    }
}

fn nullable(desc: &Option<TensorDesc>) -> *const TensorDesc {
    desc.as_ref().map_or(ptr::null(), |d| d as *const TensorDesc)
}

fn opt_desc(t: Option<&Tensor>) -> Result<Option<TensorDesc>> {
    t.map(TensorDesc::new).transpose()
}

// ---------------------------------------------------------------------------
// Library
// ---------------------------------------------------------------------------

/// A loaded kernel extension.
pub struct ExtensionLibrary {
    path: PathBuf,
    name: String,
    caps: CapabilitySet,
    mha_fwd: Option<FnMhaFwd>,
    mha_bwd: Option<FnMhaBwd>,
    mha_varlen_fwd: Option<FnMhaVarlenFwd>,
    mha_varlen_bwd: Option<FnMhaVarlenBwd>,
    rms_norm: Option<FnRmsNorm>,
    rms_norm_backward: Option<FnRmsNormBwd>,
    // dropped last so no function pointer outlives the mapping
    _lib: Library,
}

impl std::fmt::Debug for ExtensionLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionLibrary")
            .field("path", &self.path)
            .field("capabilities", &self.caps)
            .finish()
    }
}

fn load_error(path: &Path, reason: impl ToString) -> FuseError {
    FuseError::ExtensionLoad {
        path: path.display().to_string(),
        reason: reason.to_string(),
    }
}

/// Resolve `fusekit_<capability>`; a missing symbol disables the capability.
///
/// # Safety
/// `T` must be the function pointer type the symbol was exported with.
unsafe fn optional<T: Copy>(lib: &Library, path: &Path, cap: Capability) -> Option<T> {
    let symbol = format!("fusekit_{}\0", cap.name());
    match lib.get::<T>(symbol.as_bytes()) {
        Ok(f) => Some(*f),
        Err(_) => {
            tracing::warn!(
                path = %path.display(),
                symbol = symbol.trim_end_matches('\0'),
                "kernel extension does not export symbol; capability disabled"
            );
            None
        }
    }
}

impl ExtensionLibrary {
    /// Load the library, check its ABI version and resolve its kernels.
    pub fn open(config: &ExtensionConfig) -> Result<Self> {
        let path = config.library_path.as_path();
        let lib = unsafe { Library::new(path) }.map_err(|e| load_error(path, e))?;

        let abi_version = unsafe { lib.get::<FnAbiVersion>(b"fusekit_abi_version\0") }
            .map(|f| *f)
            .map_err(|e| load_error(path, e))?;
        let got = unsafe { abi_version() };
        if got != EXTENSION_ABI_VERSION {
            return Err(FuseError::AbiMismatch {
                expected: EXTENSION_ABI_VERSION,
                got,
            });
        }

        let (mha_fwd, mha_bwd, mha_varlen_fwd, mha_varlen_bwd, rms_norm, rms_norm_backward) = unsafe {
            (
                optional::<FnMhaFwd>(&lib, path, Capability::MhaFwd),
                optional::<FnMhaBwd>(&lib, path, Capability::MhaBwd),
                optional::<FnMhaVarlenFwd>(&lib, path, Capability::MhaVarlenFwd),
                optional::<FnMhaVarlenBwd>(&lib, path, Capability::MhaVarlenBwd),
                optional::<FnRmsNorm>(&lib, path, Capability::RmsNorm),
                optional::<FnRmsNormBwd>(&lib, path, Capability::RmsNormBwd),
            )
        };

        let present = [
            (Capability::MhaFwd, mha_fwd.is_some()),
            (Capability::MhaBwd, mha_bwd.is_some()),
            (Capability::MhaVarlenFwd, mha_varlen_fwd.is_some()),
            (Capability::MhaVarlenBwd, mha_varlen_bwd.is_some()),
            (Capability::RmsNorm, rms_norm.is_some()),
            (Capability::RmsNormBwd, rms_norm_backward.is_some()),
        ];
        let caps: CapabilitySet = present.iter().filter(|(_, ok)| *ok).map(|(c, _)| *c).collect();

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        caps.require(&name, &config.require)?;

        tracing::info!(
            path = %path.display(),
            abi_version = got,
            capabilities = ?caps,
            "loaded kernel extension"
        );

        Ok(Self {
            path: path.to_path_buf(),
            name,
            caps,
            mha_fwd,
            mha_bwd,
            mha_varlen_fwd,
            mha_varlen_bwd,
            rms_norm,
            rms_norm_backward,
            _lib: lib,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry<T: Copy>(&self, f: Option<T>, cap: Capability) -> Result<T> {
        f.ok_or_else(|| FuseError::MissingCapability {
            backend: self.name.clone(),
            capability: cap.name(),
        })
    }
}

/// Snapshot the generator and reserve `draws` values of its stream.
fn reserve(config: &MhaConfig, rng: &mut Generator, draws: u64) -> (RngState, MhaScalars) {
    let state = rng.get_state();
    if config.dropout_p > 0.0 {
        let _ = rng.stream(draws);
    }
    let scalars = MhaScalars {
        dropout_p: config.dropout_p,
        softmax_scale: config.softmax_scale,
        causal: config.causal as c_int,
        return_softmax: config.return_softmax as c_int,
        seed: state.seed,
        offset: state.offset,
    };
    (state, scalars)
}

fn require_rank(t: &Tensor, rank: usize) -> Result<()> {
    if t.ndim() != rank {
        return Err(FuseError::InvalidArgument(format!(
            "expected a rank-{rank} tensor, got shape {}",
            t.shape()
        )));
    }
    Ok(())
}

fn shape_arg(normalized_shape: Option<&[usize]>) -> (Vec<i64>, c_int) {
    match normalized_shape {
        Some(shape) => (shape.iter().map(|&d| d as i64).collect(), shape.len() as c_int),
        None => (Vec::new(), -1),
    }
}

fn stat_dims(input: &Tensor, normalized_shape: Option<&[usize]>) -> Result<Vec<usize>> {
    let rank = normalized_shape.map_or(1, |s| s.len());
    if rank > input.ndim() {
        return Err(FuseError::InvalidAxis {
            axis: rank,
            ndim: input.ndim(),
        });
    }
    let mut dims = input.dims()[..input.ndim() - rank].to_vec();
    dims.extend(std::iter::repeat(1).take(rank));
    Ok(dims)
}

impl KernelBackend for ExtensionLibrary {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }
}

impl AttentionKernels for ExtensionLibrary {
    fn mha_fwd(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        config: &MhaConfig,
        rng: &mut Generator,
    ) -> Result<AttentionForward> {
        let f = self.entry(self.mha_fwd, Capability::MhaFwd)?;
        require_rank(q, 4)?;
        require_rank(k, 4)?;
        let (b, sq, hq, sk) = (q.dims()[0], q.dims()[1], q.dims()[2], k.dims()[1]);

        let out = q.zeros_like();
        let lse = Tensor::zeros(&[b, hq, sq], DType::F32);
        let mask = config
            .return_softmax
            .then(|| Tensor::zeros(&[b, hq, sq, sk], DType::F32));
        let (rng_state, scalars) = reserve(config, rng, (b * hq * sq * sk) as u64);

        let (d_q, d_k, d_v) = (TensorDesc::new(q)?, TensorDesc::new(k)?, TensorDesc::new(v)?);
        let (d_out, d_lse) = (TensorDesc::new(&out)?, TensorDesc::new(&lse)?);
        let d_mask = opt_desc(mask.as_ref())?;
        check("mha_fwd", unsafe { f(&d_q, &d_k, &d_v, &d_out, &d_lse, nullable(&d_mask), &scalars) })?;

        Ok(AttentionForward {
            out,
            softmax_lse: lse,
            rng_state,
            s_dmask: mask,
        })
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
        let f = self.entry(self.mha_bwd, Capability::MhaBwd)?;
        require_rank(q, 4)?;
        require_rank(k, 4)?;
        let (b, sq, hq, sk) = (q.dims()[0], q.dims()[1], q.dims()[2], k.dims()[1]);
        let (_, scalars) = reserve(config, rng, (b * hq * sq * sk) as u64);

        let (d_dout, d_out, d_lse) = (TensorDesc::new(dout)?, TensorDesc::new(out)?, TensorDesc::new(softmax_lse)?);
        let (d_q, d_k, d_v) = (TensorDesc::new(q)?, TensorDesc::new(k)?, TensorDesc::new(v)?);
        let (d_dq, d_dk, d_dv) = (TensorDesc::new(dq)?, TensorDesc::new(dk)?, TensorDesc::new(dv)?);
        check("mha_bwd", unsafe {
            f(&d_dout, &d_q, &d_k, &d_v, &d_out, &d_lse, &d_dq, &d_dk, &d_dv, &scalars)
        })
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
        let f = self.entry(self.mha_varlen_fwd, Capability::MhaVarlenFwd)?;
        require_rank(q, 3)?;
        let (total_q, hq) = (q.dims()[0], q.dims()[1]);
        let n = batch.batch_size();
        let (max_q, max_k) = (batch.max_seqlen_q, batch.max_seqlen_k);

        let out = q.zeros_like();
        let lse = Tensor::zeros(&[hq, total_q], DType::F32);
        let mask = config
            .return_softmax
            .then(|| Tensor::zeros(&[n, hq, max_q, max_k], DType::F32));
        let (rng_state, scalars) = reserve(config, rng, (n * hq * max_q * max_k) as u64);

        let (d_q, d_k, d_v) = (TensorDesc::new(q)?, TensorDesc::new(k)?, TensorDesc::new(v)?);
        let cu_q = TensorDesc::new(&batch.cu_seqlens_q)?;
        let cu_k = TensorDesc::new(&batch.cu_seqlens_k)?;
        let (d_out, d_lse) = (TensorDesc::new(&out)?, TensorDesc::new(&lse)?);
        let d_mask = opt_desc(mask.as_ref())?;
        check("mha_varlen_fwd", unsafe {
            f(
                &d_q,
                &d_k,
                &d_v,
                &cu_q,
                &cu_k,
                max_q as i64,
                max_k as i64,
                &d_out,
                &d_lse,
                nullable(&d_mask),
                &scalars,
            )
        })?;

        Ok(AttentionForward {
            out,
            softmax_lse: lse,
            rng_state,
            s_dmask: mask,
        })
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
        let f = self.entry(self.mha_varlen_bwd, Capability::MhaVarlenBwd)?;
        require_rank(q, 3)?;
        let hq = q.dims()[1];
        let (max_q, max_k) = (batch.max_seqlen_q, batch.max_seqlen_k);
        let (_, scalars) = reserve(config, rng, (batch.batch_size() * hq * max_q * max_k) as u64);

        let dq = dq.cloned().unwrap_or_else(|| q.zeros_like());
        let dk = dk.cloned().unwrap_or_else(|| k.zeros_like());
        let dv = dv.cloned().unwrap_or_else(|| v.zeros_like());

        let (d_dout, d_out, d_lse) = (TensorDesc::new(dout)?, TensorDesc::new(out)?, TensorDesc::new(softmax_lse)?);
        let (d_q, d_k, d_v) = (TensorDesc::new(q)?, TensorDesc::new(k)?, TensorDesc::new(v)?);
        let cu_q = TensorDesc::new(&batch.cu_seqlens_q)?;
        let cu_k = TensorDesc::new(&batch.cu_seqlens_k)?;
        let (d_dq, d_dk, d_dv) = (TensorDesc::new(&dq)?, TensorDesc::new(&dk)?, TensorDesc::new(&dv)?);
        check("mha_varlen_bwd", unsafe {
            f(
                &d_dout,
                &d_q,
                &d_k,
                &d_v,
                &d_out,
                &d_lse,
                &cu_q,
                &cu_k,
                max_q as i64,
                max_k as i64,
                &d_dq,
                &d_dk,
                &d_dv,
                &scalars,
            )
        })?;
        Ok((dq, dk, dv))
    }
}

impl RmsNormKernels for ExtensionLibrary {
    fn rms_norm(
        &self,
        input: &Tensor,
        normalized_shape: Option<&[usize]>,
        weight: &Tensor,
        bias: Option<&Tensor>,
        eps: f64,
    ) -> Result<(Tensor, Tensor)> {
        let f = self.entry(self.rms_norm, Capability::RmsNorm)?;
        let out = input.zeros_like();
        let inv_rms = Tensor::zeros(&stat_dims(input, normalized_shape)?, input.dtype());
        let (shape, rank) = shape_arg(normalized_shape);

        let (d_in, d_w) = (TensorDesc::new(input)?, TensorDesc::new(weight)?);
        let d_bias = opt_desc(bias)?;
        let (d_out, d_inv) = (TensorDesc::new(&out)?, TensorDesc::new(&inv_rms)?);
        check("rms_norm", unsafe {
            f(&d_in, shape.as_ptr(), rank, &d_w, nullable(&d_bias), &d_out, &d_inv, eps)
        })?;
        Ok((out, inv_rms))
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
        let f = self.entry(self.rms_norm_backward, Capability::RmsNormBwd)?;
        let grad_input = input.zeros_like();
        let grad_weight = weight.zeros_like();
        let grad_bias = bias.map(Tensor::zeros_like);
        let (shape, rank) = shape_arg(normalized_shape);

        let (d_in, d_go, d_inv) = (
            TensorDesc::new(input)?,
            TensorDesc::new(grad_output)?,
            TensorDesc::new(inv_rms)?,
        );
        let (d_w, d_b) = (TensorDesc::new(weight)?, opt_desc(bias)?);
        let (d_gi, d_gw, d_gb) = (
            TensorDesc::new(&grad_input)?,
            TensorDesc::new(&grad_weight)?,
            opt_desc(grad_bias.as_ref())?,
        );
        check("rms_norm_backward", unsafe {
            f(
                &d_in,
                &d_go,
                &d_inv,
                shape.as_ptr(),
                rank,
                &d_w,
                nullable(&d_b),
                &d_gi,
                &d_gw,
                nullable(&d_gb),
                eps,
            )
        })?;
        Ok(RmsNormGrads {
            grad_input,
            grad_weight,
            grad_bias,
        })
    }
}
