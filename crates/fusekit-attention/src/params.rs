use serde::{Deserialize, Serialize};

use fusekit_core::Tensor;
use fusekit_kernels::MhaConfig;

/// Per-call attention settings.
///
/// Deserializable so a model config can carry it directly:
///
/// ```
/// use fusekit_attention::AttentionParams;
///
/// let params: AttentionParams = serde_json::from_str(r#"{"dropout_p": 0.1, "causal": true}"#).unwrap();
/// assert_eq!(params, AttentionParams::default().dropout(0.1).causal(true));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionParams {
    /// Probability of dropping an attention weight, in `[0, 1)`.
    pub dropout_p: f32,
    /// Softmax temperature; `None` means `head_dim^-0.5`.
    pub softmax_scale: Option<f32>,
    pub causal: bool,
    /// Also return the softmax statistics (and the dropout matrix when
    /// dropout is active).
    pub return_softmax: bool,
}

impl AttentionParams {
    pub fn dropout(mut self, p: f32) -> Self {
        self.dropout_p = p;
        self
    }

    pub fn softmax_scale(mut self, scale: f32) -> Self {
        self.softmax_scale = Some(scale);
        self
    }

    pub fn causal(mut self, causal: bool) -> Self {
        self.causal = causal;
        self
    }

    pub fn return_softmax(mut self, return_softmax: bool) -> Self {
        self.return_softmax = return_softmax;
        self
    }

    /// Kernel settings for a head dimension of `head_dim`.
    pub(crate) fn resolve(&self, head_dim: usize) -> MhaConfig {
        MhaConfig {
            dropout_p: self.dropout_p,
            softmax_scale: self
                .softmax_scale
                .unwrap_or_else(|| 1.0 / (head_dim as f32).sqrt()),
            causal: self.causal,
            return_softmax: self.return_softmax && self.dropout_p > 0.0,
        }
    }
}

/// What an attention call hands back.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Attention output; the only differentiable result.
    pub out: Tensor,
    /// Softmax log-sum-exp, present when `return_softmax` was set.
    pub softmax_lse: Option<Tensor>,
    /// Dropout/softmax matrix, present when `return_softmax` was set and
    /// dropout was active.
    pub s_dmask: Option<Tensor>,
}
