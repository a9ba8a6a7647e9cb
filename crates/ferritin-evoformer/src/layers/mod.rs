pub mod attention;
pub mod dropout;
pub mod linear;
pub mod msa_attention;
pub mod norm;
pub mod outer_product_mean;
pub mod transition;
pub mod triangular_attention;
pub mod triangular_multiplication;

use candle_core::{Result, Tensor};

/// Logistic sigmoid composed from differentiable ops.
pub(crate) fn sigmoid(x: &Tensor) -> Result<Tensor> {
    (x.neg()?.exp()? + 1.0)?.recip()
}

/// `log(1 + exp(x))`.
pub(crate) fn softplus(x: &Tensor) -> Result<Tensor> {
    (x.exp()? + 1.0)?.log()
}

/// `(mask - 1) * inf`: zero where the mask is set, `-inf` where it is not.
pub(crate) fn mask_bias(mask: &Tensor, inf: f64) -> Result<Tensor> {
    mask.affine(inf, -inf)
}
