//! # fusekit-attention
//!
//! Fused multi-head attention as a differentiable op.
//!
//! Four call shapes share one bridge:
//! - `mha_qkvpacked`: fixed-length, packed `[b, s, 3, h, d]`
//! - `mha`: fixed-length, separate Q/K/V (grouped-query heads allowed)
//! - `mha_varlen_qkvpacked`: ragged batch, packed `[total, 3, h, d]`
//! - `mha_varlen`: ragged batch, separate Q/K/V
//!
//! Dropout randomness comes from an explicit `Generator`. Its state is
//! captured at forward time and replayed into a fresh generator for
//! backward, so the backward kernel sees exactly the forward dropout mask.

mod backward;
pub mod bridge;
pub mod params;

pub use bridge::AttentionBridge;
pub use params::{AttentionOutput, AttentionParams};
