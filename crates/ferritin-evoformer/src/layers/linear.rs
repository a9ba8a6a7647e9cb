//! Linear projection over the trailing channel axis of a tensor of any rank.
use candle_core::{Module, Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct Linear {
    inner: candle_nn::Linear,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn load(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: candle_nn::linear(in_dim, out_dim, vb)?,
            in_dim,
            out_dim,
        })
    }

    pub fn load_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            inner: candle_nn::linear_no_bias(in_dim, out_dim, vb)?,
            in_dim,
            out_dim,
        })
    }

    /// Weight in `[out, in]` layout.
    pub fn weight(&self) -> &Tensor {
        self.inner.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.inner.bias()
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }
}

impl Module for Linear {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // Flatten the leading dims so every rank goes through a single 2D matmul.
        let dims = x.dims();
        let Some((&last, lead)) = dims.split_last() else {
            candle_core::bail!("linear: scalar input")
        };
        if last != self.in_dim {
            candle_core::bail!(
                "linear: expected trailing dim {}, got shape {:?}",
                self.in_dim,
                dims
            )
        }
        let rows = lead.iter().product::<usize>();
        let y = self.inner.forward(&x.reshape((rows, last))?)?;
        let mut out_shape = lead.to_vec();
        out_shape.push(self.out_dim);
        y.reshape(out_shape)
    }
}
