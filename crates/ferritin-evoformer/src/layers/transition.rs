//! Two-layer feed-forward transition (Algorithms 9 and 15).
use super::linear::Linear;
use super::norm::LayerNorm;
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct Transition {
    layer_norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
}

impl Transition {
    pub fn load(vb: VarBuilder, c: usize, n: usize) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(c, vb.pp("layer_norm"))?,
            linear_1: Linear::load(c, n * c, vb.pp("linear_1"))?,
            linear_2: Linear::load(n * c, c, vb.pp("linear_2"))?,
        })
    }

    /// Update for `x` `[*, c]`, zeroed wherever `mask` `[*]` is unset.
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(x.dtype())?.unsqueeze(mask.rank())?;
        let x = self.layer_norm.forward(x)?;
        let x = self.linear_1.forward(&x)?.relu()?;
        self.linear_2.forward(&x)?.broadcast_mul(&mask)
    }
}
