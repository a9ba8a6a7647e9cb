//! Outer product mean (Algorithm 10): MSA to pair communication.
use super::linear::Linear;
use super::norm::LayerNorm;
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct OuterProductMean {
    layer_norm: LayerNorm,
    linear_1: Linear,
    linear_2: Linear,
    linear_out: Linear,
    c_hidden: usize,
    eps: f64,
}

impl OuterProductMean {
    pub fn load(vb: VarBuilder, c_m: usize, c_z: usize, c_hidden: usize, eps: f64) -> Result<Self> {
        Ok(Self {
            layer_norm: LayerNorm::load(c_m, vb.pp("layer_norm"))?,
            linear_1: Linear::load(c_m, c_hidden, vb.pp("linear_1"))?,
            linear_2: Linear::load(c_m, c_hidden, vb.pp("linear_2"))?,
            linear_out: Linear::load(c_hidden * c_hidden, c_z, vb.pp("linear_out"))?,
            c_hidden,
            eps,
        })
    }

    /// `m` `[b, S, R, c_m]`, `mask` `[b, S, R]` -> pair update `[b, R, R, c_z]`.
    pub fn forward(&self, m: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, s, r, _) = m.dims4()?;
        let c = self.c_hidden;
        let mask = mask.to_dtype(m.dtype())?;
        let mask_c = mask.unsqueeze(3)?;

        let m = self.layer_norm.forward(m)?;
        let a = self.linear_1.forward(&m)?.broadcast_mul(&mask_c)?;
        let bb = self.linear_2.forward(&m)?.broadcast_mul(&mask_c)?;

        // sum_s a[s, i, c] * b[s, j, e] as one [R*c, S] x [S, R*c] product
        let a = a.reshape((b, s, r * c))?.transpose(1, 2)?.contiguous()?;
        let bb = bb.reshape((b, s, r * c))?;
        let outer = a
            .matmul(&bb)?
            .reshape((b, r, c, r, c))?
            .permute((0, 1, 3, 2, 4))?
            .reshape((b, r, r, c * c))?;
        let outer = self.linear_out.forward(&outer)?;

        // number of sequences where both residues are present, [b, R, R, 1]
        let norm = mask
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&mask)?
            .unsqueeze(3)?;
        outer.broadcast_div(&(norm + self.eps)?)
    }
}
