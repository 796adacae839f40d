use std::collections::HashMap;

use fusekit_core::{Result, Tensor};

/// A layer with trainable parameters.
pub trait Module: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor) -> Result<Tensor>;

    /// Parameters that receive gradients.
    fn parameters(&self) -> Vec<&Tensor>;

    /// Named parameters, used for state dictionaries.
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect()
    }
}
