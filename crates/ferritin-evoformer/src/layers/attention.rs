//! Gated multi-head attention with additive logit biases.
//!
//! Inputs are laid out `[batch, rows, queries, channels]`: attention runs
//! independently within each row. Biases are added to the logits of shape
//! `[batch, rows, heads, queries, keys]` after broadcasting, which is how the
//! MSA and triangle attention layers inject masks and pair biases.
use super::linear::Linear;
use super::sigmoid;
use candle_core::{bail, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct Attention {
    linear_q: Linear,
    linear_k: Linear,
    linear_v: Linear,
    linear_g: Option<Linear>,
    linear_o: Linear,
    c_hidden: usize,
    num_heads: usize,
}

impl Attention {
    pub fn load(
        vb: VarBuilder,
        c_q: usize,
        c_kv: usize,
        c_hidden: usize,
        num_heads: usize,
        gating: bool,
    ) -> Result<Self> {
        let hc = c_hidden * num_heads;
        let linear_q = Linear::load_no_bias(c_q, hc, vb.pp("linear_q"))?;
        let linear_k = Linear::load_no_bias(c_kv, hc, vb.pp("linear_k"))?;
        let linear_v = Linear::load_no_bias(c_kv, hc, vb.pp("linear_v"))?;
        let linear_g = if gating {
            Some(Linear::load(c_q, hc, vb.pp("linear_g"))?)
        } else {
            None
        };
        let linear_o = Linear::load(hc, c_q, vb.pp("linear_o"))?;
        Ok(Self {
            linear_q,
            linear_k,
            linear_v,
            linear_g,
            linear_o,
            c_hidden,
            num_heads,
        })
    }

    /// `[b, r, n, h * c] -> [b * r, h, n, c]`, rows folded into the batch so
    /// the matmuls stay within two batch dims.
    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (b, r, n, _) = x.dims4()?;
        x.reshape((b * r, n, self.num_heads, self.c_hidden))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(&self, q_x: &Tensor, kv_x: &Tensor, biases: &[&Tensor]) -> Result<Tensor> {
        if q_x.rank() != 4 || kv_x.rank() != 4 {
            bail!(
                "attention expects [batch, rows, tokens, channels], got {:?} and {:?}",
                q_x.dims(),
                kv_x.dims()
            )
        }
        let (b, r, n_q, _) = q_x.dims4()?;
        let n_k = kv_x.dim(2)?;
        let h = self.num_heads;

        let q = self.split_heads(&self.linear_q.forward(q_x)?)?;
        let q = (q / (self.c_hidden as f64).sqrt())?;
        let k = self.split_heads(&self.linear_k.forward(kv_x)?)?;
        let v = self.split_heads(&self.linear_v.forward(kv_x)?)?;

        // biases broadcast against [b, r, h, q, k]
        let mut logits = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .reshape((b, r, h, n_q, n_k))?;
        for bias in biases {
            logits = logits.broadcast_add(bias)?;
        }
        let weights = candle_nn::ops::softmax(&logits, D::Minus1)?.reshape((b * r, h, n_q, n_k))?;

        let o = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, r, n_q, h * self.c_hidden))?;
        let o = match &self.linear_g {
            Some(linear_g) => (o * sigmoid(&linear_g.forward(q_x)?)?)?,
            None => o,
        };
        self.linear_o.forward(&o)
    }
}
