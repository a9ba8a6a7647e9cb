//! Attention over the MSA representation.
//!
//! Row attention (Algorithm 7) mixes residues within each sequence and takes a
//! per-head bias projected from the pair representation. Column attention
//! (Algorithm 8) mixes sequences at each residue position.
use super::attention::Attention;
use super::linear::Linear;
use super::mask_bias;
use super::norm::LayerNorm;
use crate::utils::dap::ParallelContext;
use candle_core::{bail, Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct MsaRowAttentionWithPairBias {
    layer_norm_m: LayerNorm,
    layer_norm_z: LayerNorm,
    linear_z: Linear,
    mha: Attention,
    inf: f64,
}

impl MsaRowAttentionWithPairBias {
    pub fn load(
        vb: VarBuilder,
        c_m: usize,
        c_z: usize,
        c_hidden: usize,
        num_heads: usize,
        inf: f64,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm_m: LayerNorm::load(c_m, vb.pp("layer_norm_m"))?,
            layer_norm_z: LayerNorm::load(c_z, vb.pp("layer_norm_z"))?,
            linear_z: Linear::load_no_bias(c_z, num_heads, vb.pp("linear_z"))?,
            mha: Attention::load(vb.pp("mha"), c_m, c_m, c_hidden, num_heads, true)?,
            inf,
        })
    }

    /// Returns the update for `m`; the caller adds it through dropout.
    ///
    /// * `m`    - `[b, S, R, c_m]`, row-sharded under DAP
    /// * `z`    - `[b, R, R, c_z]`, row-sharded under DAP
    /// * `mask` - `[b, S, R]`, sharded like `m`
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        mask: &Tensor,
        ctx: &dyn ParallelContext,
    ) -> Result<Tensor> {
        let (b, _, n_res, _) = m.dims4()?;
        // [b, S, 1, 1, R]
        let bias_mask = mask_bias(&mask.to_dtype(m.dtype())?, self.inf)?
            .unsqueeze(2)?
            .unsqueeze(3)?;

        let z = self.layer_norm_z.forward(z)?;
        // [b, R / n, R, H] -> [b, R, R, H]
        let pair_bias = ctx.gather(&self.linear_z.forward(&z)?, 1)?;
        let (pb, pi, pj, _) = pair_bias.dims4()?;
        if (pb, pi, pj) != (b, n_res, n_res) {
            bail!(
                "msa row attention: pair bias {:?} does not match msa {:?}",
                pair_bias.dims(),
                m.dims()
            )
        }
        // [b, 1, H, R, R]
        let pair_bias = pair_bias.permute((0, 3, 1, 2))?.unsqueeze(1)?;

        let m = self.layer_norm_m.forward(m)?;
        self.mha.forward(&m, &m, &[&bias_mask, &pair_bias])
    }
}

#[derive(Debug, Clone)]
pub struct MsaColumnAttention {
    layer_norm_m: LayerNorm,
    mha: Attention,
    inf: f64,
}

impl MsaColumnAttention {
    pub fn load(
        vb: VarBuilder,
        c_m: usize,
        c_hidden: usize,
        num_heads: usize,
        inf: f64,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm_m: LayerNorm::load(c_m, vb.pp("layer_norm_m"))?,
            mha: Attention::load(vb.pp("mha"), c_m, c_m, c_hidden, num_heads, true)?,
            inf,
        })
    }

    /// Returns `m` with the column-attention residual already applied.
    ///
    /// `m` is `[b, S, R, c_m]` and `mask` `[b, S, R]`, column-sharded under DAP.
    pub fn forward(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let m_t = m.transpose(1, 2)?.contiguous()?;
        // [b, R, 1, 1, S]
        let bias_mask = mask_bias(&mask.to_dtype(m.dtype())?.transpose(1, 2)?, self.inf)?
            .unsqueeze(2)?
            .unsqueeze(3)?;
        let x = self.layer_norm_m.forward(&m_t)?;
        let update = self.mha.forward(&x, &x, &[&bias_mask])?;
        (m_t + update)?.transpose(1, 2)?.contiguous()
    }
}
