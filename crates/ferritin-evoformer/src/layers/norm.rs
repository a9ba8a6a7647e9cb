//! Layer normalization over the trailing channel axis.
//!
//! Built from elementary tensor ops so that every step has a gradient, which
//! the recomputing stack relies on. Half-precision inputs are normalized in
//! f32 and cast back.
use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Init, VarBuilder};

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn load(dim: usize, vb: VarBuilder) -> Result<Self> {
        Self::load_with_eps(dim, 1e-5, vb)
    }

    pub fn load_with_eps(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(dim, "weight", Init::Const(1.))?;
        let bias = vb.get_with_hints(dim, "bias", Init::Const(0.))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_dtype = x.dtype();
        let x = match in_dtype {
            DType::F16 | DType::BF16 => x.to_dtype(DType::F32)?,
            _ => x.clone(),
        };
        let mean = x.mean_keepdim(D::Minus1)?;
        let centered = x.broadcast_sub(&mean)?;
        let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
        let normed = centered.broadcast_div(&(var + self.eps)?.sqrt()?)?;
        normed
            .to_dtype(in_dtype)?
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn test_normalized_rows_have_zero_mean_unit_variance() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let ln = LayerNorm::load(6, vb)?;
        let x = (Tensor::randn(0f32, 3., (2, 4, 6), &dev)? + 5.)?;
        let y = ln.forward(&x)?;
        let mean = y.mean_keepdim(D::Minus1)?.abs()?.max_keepdim(0)?;
        let var = y.sqr()?.mean_keepdim(D::Minus1)?;
        for m in mean.flatten_all()?.to_vec1::<f32>()? {
            assert!(m < 1e-5, "mean {m}");
        }
        for v in var.flatten_all()?.to_vec1::<f32>()? {
            assert!((v - 1.).abs() < 1e-3, "variance {v}");
        }
        Ok(())
    }
}
