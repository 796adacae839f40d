//! RMS normalization as a differentiable op.
//!
//! `y = x / sqrt(mean(x^2) + eps) * weight + bias`
//!
//! Two entry points share one kernel pair:
//! - `rms_norm`: native precision, reduces over the last dimension.
//! - `rms_norm_with_shape`: reduces over an explicit trailing shape and runs
//!   the kernels in F32, casting the outputs back to the input's dtype.

use std::sync::Arc;

use fusekit_core::autograd::{self, GradFn};
use fusekit_core::{DType, Result, Tensor};
use fusekit_kernels::{Capability, RmsNormKernels};

/// Differentiable RMS normalization over an external kernel set.
#[derive(Clone)]
pub struct RmsNormBridge {
    kernels: Arc<dyn RmsNormKernels>,
}

impl std::fmt::Debug for RmsNormBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RmsNormBridge")
            .field("backend", &self.kernels.name())
            .finish()
    }
}

/// Tensors recorded as graph inputs, in gradient order.
fn graph_inputs<'a>(input: &'a Tensor, weight: &'a Tensor, bias: Option<&'a Tensor>) -> Vec<&'a Tensor> {
    let mut inputs = vec![input, weight];
    inputs.extend(bias);
    inputs
}

impl RmsNormBridge {
    /// Wrap `kernels`, failing with `MissingCapability` unless both the
    /// forward and backward kernels are present.
    pub fn new(kernels: Arc<dyn RmsNormKernels>) -> Result<Self> {
        kernels
            .capabilities()
            .require(kernels.name(), &Capability::RMS_NORM)?;
        Ok(Self { kernels })
    }

    pub fn backend_name(&self) -> &str {
        self.kernels.name()
    }

    /// Normalize over the last dimension in the input's own precision.
    pub fn rms_norm(&self, input: &Tensor, weight: &Tensor, bias: Option<&Tensor>, eps: f64) -> Result<Tensor> {
        tracing::debug!(variant = "implicit", dims = ?input.dims(), dtype = %input.dtype(), bias = bias.is_some(), eps, "rms_norm forward");
        let (out, inv_rms) = self.kernels.rms_norm(input, None, weight, bias, eps)?;

        let inputs = graph_inputs(input, weight, bias);
        if !autograd::any_tracks_grad(&inputs) {
            return Ok(out);
        }
        let grad_fn = RmsNormBackward {
            kernels: Arc::clone(&self.kernels),
            input: input.detach(),
            inv_rms,
            weight: weight.detach(),
            bias: bias.map(Tensor::detach),
            eps,
        };
        Ok(autograd::record_op(out, Box::new(grad_fn), &inputs))
    }

    /// Normalize over the trailing `normalized_shape` dimensions.
    ///
    /// The kernels see F32 copies of every tensor; the output and inverse
    /// RMS are cast back to `input`'s dtype. Gradients stay in F32.
    pub fn rms_norm_with_shape(
        &self,
        input: &Tensor,
        weight: &Tensor,
        bias: Option<&Tensor>,
        eps: f64,
        normalized_shape: &[usize],
    ) -> Result<Tensor> {
        tracing::debug!(
            variant = "explicit",
            dims = ?input.dims(),
            normalized_shape = ?normalized_shape,
            dtype = %input.dtype(),
            bias = bias.is_some(),
            eps,
            "rms_norm forward"
        );
        let bias_f32 = bias.map(|b| b.to_dtype(DType::F32));
        let (out, inv_rms) = self.kernels.rms_norm(
            &input.to_dtype(DType::F32),
            Some(normalized_shape),
            &weight.to_dtype(DType::F32),
            bias_f32.as_ref(),
            eps,
        )?;
        let out = out.to_dtype(input.dtype());
        let inv_rms = inv_rms.to_dtype(input.dtype());

        let inputs = graph_inputs(input, weight, bias);
        if !autograd::any_tracks_grad(&inputs) {
            return Ok(out);
        }
        let grad_fn = RmsNormShapedBackward {
            kernels: Arc::clone(&self.kernels),
            input: input.detach(),
            inv_rms,
            weight: weight.detach(),
            bias: bias.map(Tensor::detach),
            eps,
            normalized_shape: normalized_shape.to_vec(),
        };
        Ok(autograd::record_op(out, Box::new(grad_fn), &inputs))
    }
}

fn into_grads(grads: fusekit_kernels::RmsNormGrads) -> Vec<Option<Tensor>> {
    let mut out = vec![Some(grads.grad_input), Some(grads.grad_weight)];
    if let Some(db) = grads.grad_bias {
        out.push(Some(db));
    }
    out
}

struct RmsNormBackward {
    kernels: Arc<dyn RmsNormKernels>,
    input: Tensor,
    inv_rms: Tensor,
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
}

impl GradFn for RmsNormBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        tracing::debug!(variant = "implicit", dims = ?self.input.dims(), "rms_norm backward");
        let grads = self.kernels.rms_norm_backward(
            &self.input,
            grad_output,
            &self.inv_rms,
            None,
            &self.weight,
            self.bias.as_ref(),
            self.eps,
        )?;
        Ok(into_grads(grads))
    }

    fn name(&self) -> &str {
        "RmsNormBackward"
    }
}

struct RmsNormShapedBackward {
    kernels: Arc<dyn RmsNormKernels>,
    input: Tensor,
    inv_rms: Tensor,
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
    normalized_shape: Vec<usize>,
}

impl GradFn for RmsNormShapedBackward {
    fn apply(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>> {
        tracing::debug!(
            variant = "explicit",
            dims = ?self.input.dims(),
            normalized_shape = ?self.normalized_shape,
            "rms_norm backward"
        );
        let up = |t: &Tensor| t.to_dtype(DType::F32);
        let bias = self.bias.as_ref().map(up);
        let grads = self.kernels.rms_norm_backward(
            &up(&self.input),
            &up(grad_output),
            &up(&self.inv_rms),
            Some(self.normalized_shape.as_slice()),
            &up(&self.weight),
            bias.as_ref(),
            self.eps,
        )?;
        Ok(into_grads(grads))
    }

    fn name(&self) -> &str {
        "RmsNormShapedBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusekit_core::FuseError;
    use fusekit_kernels::{CapabilitySet, CpuKernels, KernelBackend, RmsNormGrads};
    use std::sync::Mutex;

    fn bridge() -> RmsNormBridge {
        RmsNormBridge::new(Arc::new(CpuKernels::new())).unwrap()
    }

    struct Inert;

    impl KernelBackend for Inert {
        fn name(&self) -> &str {
            "inert"
        }

        fn capabilities(&self) -> CapabilitySet {
            CapabilitySet::empty().with(Capability::RmsNorm)
        }
    }

    impl RmsNormKernels for Inert {}

    /// CPU kernels that keep the `inv_rms` produced by forward and the one
    /// handed back to backward.
    #[derive(Default)]
    struct Recording {
        forward_inv_rms: Mutex<Option<Tensor>>,
        backward_inv_rms: Mutex<Option<Tensor>>,
    }

    impl KernelBackend for Recording {
        fn name(&self) -> &str {
            "recording"
        }

        fn capabilities(&self) -> CapabilitySet {
            CpuKernels::new().capabilities()
        }
    }

    impl RmsNormKernels for Recording {
        fn rms_norm(
            &self,
            input: &Tensor,
            normalized_shape: Option<&[usize]>,
            weight: &Tensor,
            bias: Option<&Tensor>,
            eps: f64,
        ) -> Result<(Tensor, Tensor)> {
            let (out, inv_rms) = CpuKernels::new().rms_norm(input, normalized_shape, weight, bias, eps)?;
            *self.forward_inv_rms.lock().unwrap() = Some(inv_rms.clone());
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
            *self.backward_inv_rms.lock().unwrap() = Some(inv_rms.clone());
            CpuKernels::new().rms_norm_backward(input, grad_output, inv_rms, normalized_shape, weight, bias, eps)
        }
    }

    #[test]
    fn test_requires_backward_kernel() {
        match RmsNormBridge::new(Arc::new(Inert)) {
            Err(FuseError::MissingCapability { backend, capability }) => {
                assert_eq!(backend, "inert");
                assert_eq!(capability, "rms_norm_backward");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_no_node_without_tracked_inputs() {
        let x = Tensor::randn(&[2, 4], 0);
        let y = bridge().rms_norm(&x, &Tensor::ones(&[4]), None, 1e-6).unwrap();
        assert!(y.grad_node().is_none());
    }

    #[test]
    fn test_grad_fn_names() {
        let mut x = Tensor::randn(&[2, 4], 1);
        x.set_requires_grad(true);
        let w = Tensor::ones(&[4]);
        let y = bridge().rms_norm(&x, &w, None, 1e-6).unwrap();
        assert_eq!(y.grad_node().unwrap().grad_fn_name().as_deref(), Some("RmsNormBackward"));
        let y = bridge().rms_norm_with_shape(&x, &w, None, 1e-6, &[4]).unwrap();
        assert_eq!(y.grad_node().unwrap().grad_fn_name().as_deref(), Some("RmsNormShapedBackward"));
    }

    #[test]
    fn test_bias_gradient_only_when_bias_given() {
        let mut x = Tensor::randn(&[3, 4], 2);
        x.set_requires_grad(true);
        let mut w = Tensor::ones(&[4]);
        w.set_requires_grad(true);
        let mut b = Tensor::zeros(&[4], DType::F32);
        b.set_requires_grad(true);

        let y = bridge().rms_norm(&x, &w, Some(&b), 1e-6).unwrap();
        y.backward_with(Tensor::ones(&[3, 4])).unwrap();
        assert_eq!(b.grad().unwrap().to_vec_f32(), vec![3.0; 4]);

        w.zero_grad();
        let y = bridge().rms_norm(&x, &w, None, 1e-6).unwrap();
        y.backward_with(Tensor::ones(&[3, 4])).unwrap();
        assert!(w.grad().is_some());
        assert_eq!(b.grad().unwrap().to_vec_f32(), vec![3.0; 4]);
    }

    #[test]
    fn test_explicit_saves_inv_rms_in_input_dtype() {
        let kernels = Arc::new(Recording::default());
        let bridge = RmsNormBridge::new(kernels.clone()).unwrap();
        let mut x = Tensor::randn(&[2, 3, 4], 3).to_dtype(DType::F16);
        x.set_requires_grad(true);
        let w = Tensor::ones(&[3, 4]).to_dtype(DType::F16);

        let y = bridge.rms_norm_with_shape(&x, &w, None, 1e-6, &[3, 4]).unwrap();
        y.backward_with(Tensor::ones(&[2, 3, 4]).to_dtype(DType::F16)).unwrap();

        let computed = kernels.forward_inv_rms.lock().unwrap().take().unwrap();
        let replayed = kernels.backward_inv_rms.lock().unwrap().take().unwrap();
        assert_eq!(computed.dtype(), DType::F32);
        assert_eq!(replayed.dtype(), DType::F32);
        assert_eq!(replayed.dims(), &[2, 1, 1]);
        // backward sees the F16-rounded statistic, up-cast again
        let rounded = computed.to_dtype(DType::F16).to_dtype(DType::F32);
        assert_eq!(replayed.to_vec_f32(), rounded.to_vec_f32());
    }

    #[test]
    fn test_implicit_saves_inv_rms_unchanged() {
        let kernels = Arc::new(Recording::default());
        let bridge = RmsNormBridge::new(kernels.clone()).unwrap();
        let mut x = Tensor::randn(&[2, 4], 4);
        x.set_requires_grad(true);

        let y = bridge.rms_norm(&x, &Tensor::ones(&[4]), None, 1e-6).unwrap();
        y.backward_with(Tensor::ones(&[2, 4])).unwrap();

        let computed = kernels.forward_inv_rms.lock().unwrap().take().unwrap();
        let replayed = kernels.backward_inv_rms.lock().unwrap().take().unwrap();
        assert_eq!(replayed.to_vec_f32(), computed.to_vec_f32());
    }
}
