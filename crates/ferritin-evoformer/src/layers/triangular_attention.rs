//! Triangle self-attention around the starting and ending node
//! (Algorithms 13 and 14).
use super::attention::Attention;
use super::linear::Linear;
use super::mask_bias;
use super::norm::LayerNorm;
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangleNode {
    Starting,
    Ending,
}

#[derive(Debug, Clone)]
pub struct TriangleAttention {
    layer_norm: LayerNorm,
    linear: Linear,
    mha: Attention,
    inf: f64,
    node: TriangleNode,
}

impl TriangleAttention {
    pub fn load(
        vb: VarBuilder,
        c_z: usize,
        c_hidden: usize,
        num_heads: usize,
        inf: f64,
        node: TriangleNode,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(c_z, vb.pp("layer_norm"))?,
            linear: Linear::load_no_bias(c_z, num_heads, vb.pp("linear"))?,
            mha: Attention::load(vb.pp("mha"), c_z, c_z, c_hidden, num_heads, true)?,
            inf,
            node,
        })
    }

    /// `z` `[b, R, R, c_z]`, `mask` `[b, R, R]` -> update `[b, R, R, c_z]`.
    pub fn forward(&self, z: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(z.dtype())?;
        let (z, mask) = match self.node {
            TriangleNode::Starting => (z.clone(), mask),
            TriangleNode::Ending => (
                z.transpose(1, 2)?.contiguous()?,
                mask.transpose(1, 2)?.contiguous()?,
            ),
        };
        let z = self.layer_norm.forward(&z)?;
        // [b, R, 1, 1, R]
        let bias_mask = mask_bias(&mask, self.inf)?.unsqueeze(2)?.unsqueeze(3)?;
        // [b, 1, H, R, R]
        let tri_bias = self
            .linear
            .forward(&z)?
            .permute((0, 3, 1, 2))?
            .unsqueeze(1)?;
        let x = self.mha.forward(&z, &z, &[&bias_mask, &tri_bias])?;
        match self.node {
            TriangleNode::Starting => Ok(x),
            TriangleNode::Ending => x.transpose(1, 2)?.contiguous(),
        }
    }
}
