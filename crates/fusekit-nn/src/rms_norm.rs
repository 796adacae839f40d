//! RMSNorm layer over a fused kernel bridge.
//!
//! `y = x / sqrt(mean(x^2) + eps) * weight + bias`
//!
//! The weight is a trainable parameter initialised to ones. The bias is a
//! fixed zero buffer that is handed to the kernel but never trained.

use fusekit_core::{DType, Result, Tensor};

use crate::bridge::RmsNormBridge;
use crate::module::Module;

pub const DEFAULT_EPS: f64 = 1e-6;

/// Root Mean Square Layer Normalization.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    bridge: RmsNormBridge,
    weight: Tensor,
    bias: Tensor,
    eps: f64,
    /// Reduce over `weight`'s shape in F32 instead of the last dimension
    /// in native precision.
    explicit_shape: bool,
}

impl RmsNorm {
    /// Normalize the last `hidden_size` dimension in the input's precision.
    pub fn new(bridge: RmsNormBridge, hidden_size: usize, eps: f64) -> Self {
        let mut weight = Tensor::ones(&[hidden_size]);
        weight.set_requires_grad(true);
        Self {
            bridge,
            weight,
            bias: Tensor::zeros(&[hidden_size], DType::F32),
            eps,
            explicit_shape: false,
        }
    }

    /// Like `new`, but passes the weight's shape to the kernel and computes
    /// in F32.
    pub fn with_normalized_shape(bridge: RmsNormBridge, hidden_size: usize, eps: f64) -> Self {
        Self {
            explicit_shape: true,
            ..Self::new(bridge, hidden_size, eps)
        }
    }

    /// Layer around a pre-trained weight. The weight is used as given and
    /// the zero bias takes its shape and dtype.
    pub fn from_weight(bridge: RmsNormBridge, weight: Tensor, eps: f64) -> Self {
        let bias = Tensor::zeros(weight.dims(), weight.dtype());
        Self {
            bridge,
            weight,
            bias,
            eps,
            explicit_shape: false,
        }
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> &Tensor {
        &self.bias
    }
}

impl std::fmt::Display for RmsNorm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RmsNorm(shape={:?}, eps={}, explicit_shape={})",
            self.weight.dims(),
            self.eps,
            self.explicit_shape
        )
    }
}

impl Module for RmsNorm {
    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        if self.explicit_shape {
            self.bridge
                .rms_norm_with_shape(input, &self.weight, Some(&self.bias), self.eps, self.weight.dims())
        } else {
            self.bridge.rms_norm(input, &self.weight, Some(&self.bias), self.eps)
        }
    }

    fn parameters(&self) -> Vec<&Tensor> {
        vec![&self.weight]
    }

    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("weight".into(), &self.weight)]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use fusekit_kernels::CpuKernels;

    use super::*;

    fn bridge() -> RmsNormBridge {
        RmsNormBridge::new(Arc::new(CpuKernels::new())).unwrap()
    }

    #[test]
    fn test_shape_preserved() {
        let norm = RmsNorm::new(bridge(), 8, DEFAULT_EPS);
        let out = norm.forward(&Tensor::ones(&[2, 3, 8])).unwrap();
        assert_eq!(out.dims(), &[2, 3, 8]);
    }

    #[test]
    fn test_unit_input() {
        let norm = RmsNorm::new(bridge(), 4, DEFAULT_EPS);
        let out = norm.forward(&Tensor::ones(&[1, 4])).unwrap();
        for v in out.to_vec_f32() {
            assert!((v - 1.0).abs() < 1e-3, "got {v}");
        }
    }

    #[test]
    fn test_only_weight_is_trainable() {
        let norm = RmsNorm::with_normalized_shape(bridge(), 16, 1e-5);
        let params = norm.parameters();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].numel(), 16);
        assert!(!norm.bias().requires_grad());
        assert_eq!(norm.state_dict().len(), 1);
    }

    #[test]
    fn test_weight_gradient() {
        let norm = RmsNorm::new(bridge(), 4, DEFAULT_EPS);
        let out = norm.forward(&Tensor::randn(&[3, 4], 9)).unwrap();
        out.backward_with(Tensor::ones(&[3, 4])).unwrap();
        let g = norm.weight().grad().unwrap();
        assert_eq!(g.dims(), &[4]);
        assert!(g.to_vec_f32().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_from_weight_bias_follows_weight() {
        let weight = Tensor::ones(&[8]).to_dtype(DType::BF16);
        let norm = RmsNorm::from_weight(bridge(), weight, DEFAULT_EPS);
        assert_eq!(norm.bias().dtype(), DType::BF16);
        assert_eq!(norm.bias().dims(), &[8]);
        let out = norm.forward(&Tensor::randn(&[2, 8], 10).to_dtype(DType::BF16)).unwrap();
        assert_eq!(out.dtype(), DType::BF16);
    }

    #[test]
    fn test_display() {
        let s = RmsNorm::new(bridge(), 64, 1e-5).to_string();
        assert!(s.contains("RmsNorm"));
        assert!(s.contains("64"));
    }
}
