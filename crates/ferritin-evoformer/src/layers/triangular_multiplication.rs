//! Triangle multiplicative updates (Algorithms 11 and 12).
use super::linear::Linear;
use super::norm::LayerNorm;
use super::sigmoid;
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

/// Which edges of the triangle `(i, j, k)` are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriangleDirection {
    /// `z_ij <- sum_k a_ik * b_jk`
    Outgoing,
    /// `z_ij <- sum_k a_ki * b_kj`
    Incoming,
}

#[derive(Debug, Clone)]
pub struct TriangleMultiplication {
    layer_norm_in: LayerNorm,
    linear_a_p: Linear,
    linear_a_g: Linear,
    linear_b_p: Linear,
    linear_b_g: Linear,
    layer_norm_out: LayerNorm,
    linear_z: Linear,
    linear_g: Linear,
    direction: TriangleDirection,
}

impl TriangleMultiplication {
    pub fn load(
        vb: VarBuilder,
        c_z: usize,
        c_hidden: usize,
        direction: TriangleDirection,
    ) -> Result<Self> {
        Ok(Self {
            layer_norm_in: LayerNorm::load(c_z, vb.pp("layer_norm_in"))?,
            linear_a_p: Linear::load(c_z, c_hidden, vb.pp("linear_a_p"))?,
            linear_a_g: Linear::load(c_z, c_hidden, vb.pp("linear_a_g"))?,
            linear_b_p: Linear::load(c_z, c_hidden, vb.pp("linear_b_p"))?,
            linear_b_g: Linear::load(c_z, c_hidden, vb.pp("linear_b_g"))?,
            layer_norm_out: LayerNorm::load(c_hidden, vb.pp("layer_norm_out"))?,
            linear_z: Linear::load(c_hidden, c_z, vb.pp("linear_z"))?,
            linear_g: Linear::load(c_z, c_z, vb.pp("linear_g"))?,
            direction,
        })
    }

    fn gated(&self, p: &Linear, g: &Linear, z: &Tensor, mask: &Tensor) -> Result<Tensor> {
        (sigmoid(&g.forward(z)?)? * p.forward(z)?)?.broadcast_mul(mask)
    }

    /// `z` `[b, R, R, c_z]`, `mask` `[b, R, R]` -> update `[b, R, R, c_z]`.
    pub fn forward(&self, z: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let mask = mask.to_dtype(z.dtype())?.unsqueeze(3)?;
        let z = self.layer_norm_in.forward(z)?;
        let a = self.gated(&self.linear_a_p, &self.linear_a_g, &z, &mask)?;
        let b = self.gated(&self.linear_b_p, &self.linear_b_g, &z, &mask)?;

        // channels first, then a plain batched matmul over k: [b, c, R, R]
        let (a, b) = match self.direction {
            TriangleDirection::Outgoing => (a.permute((0, 3, 1, 2))?, b.permute((0, 3, 2, 1))?),
            TriangleDirection::Incoming => (a.permute((0, 3, 2, 1))?, b.permute((0, 3, 1, 2))?),
        };
        let x = a
            .contiguous()?
            .matmul(&b.contiguous()?)?
            .permute((0, 2, 3, 1))?
            .contiguous()?;

        let x = self.layer_norm_out.forward(&x)?;
        let x = self.linear_z.forward(&x)?;
        x * sigmoid(&self.linear_g.forward(&z)?)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    // The incoming update of z equals the transposed outgoing update of z^T
    // when the a/b projections are swapped.
    #[test]
    fn test_incoming_is_transposed_outgoing() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let out = TriangleMultiplication::load(vb.pp("tri"), 6, 4, TriangleDirection::Outgoing)?;
        let inc = TriangleMultiplication {
            linear_a_p: out.linear_b_p.clone(),
            linear_a_g: out.linear_b_g.clone(),
            linear_b_p: out.linear_a_p.clone(),
            linear_b_g: out.linear_a_g.clone(),
            direction: TriangleDirection::Incoming,
            ..out.clone()
        };
        let z = Tensor::randn(0f32, 1., (1, 5, 5, 6), &dev)?;
        let mask = Tensor::ones((1, 5, 5), DType::F32, &dev)?;
        let z_t = z.transpose(1, 2)?.contiguous()?;

        let y_in = inc.forward(&z, &mask)?;
        let y_out = out.forward(&z_t, &mask)?.transpose(1, 2)?;
        let diff = (y_in - y_out)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(diff < 1e-5, "max difference {diff}");
        Ok(())
    }
}
