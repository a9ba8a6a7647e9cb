//! The part of an Evoformer block that runs after MSA column attention:
//! MSA transition, outer product mean and the pair stack.
use crate::config::{EvoformerBlockConfig, FusionConfig};
use crate::layers::dropout::{Mode, SharedDropout};
use crate::layers::outer_product_mean::OuterProductMean;
use crate::layers::transition::Transition;
use crate::layers::triangular_attention::{TriangleAttention, TriangleNode};
use crate::layers::triangular_multiplication::{TriangleDirection, TriangleMultiplication};
use crate::utils::dap::ParallelContext;
use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;

#[derive(Debug, Clone)]
pub struct EvoformerBlockCore {
    msa_transition: Transition,
    outer_product_mean: OuterProductMean,
    tri_mul_out: TriangleMultiplication,
    tri_mul_in: TriangleMultiplication,
    tri_att_start: TriangleAttention,
    tri_att_end: TriangleAttention,
    pair_transition: Transition,
    ps_dropout_row: SharedDropout,
    ps_dropout_col: SharedDropout,
}

impl EvoformerBlockCore {
    pub fn load(vb: VarBuilder, config: &EvoformerBlockConfig, fusion: FusionConfig) -> Result<Self> {
        let EvoformerBlockConfig {
            c_m,
            c_z,
            c_hidden_opm,
            c_hidden_tri_mul,
            c_hidden_tri_att,
            num_heads_tri,
            transition_n,
            pair_dropout,
            inf,
            eps_opm,
            ..
        } = *config;
        Ok(Self {
            msa_transition: Transition::load(vb.pp("msa_transition"), c_m, transition_n)?,
            outer_product_mean: OuterProductMean::load(
                vb.pp("outer_product_mean"),
                c_m,
                c_z,
                c_hidden_opm,
                eps_opm,
            )?,
            tri_mul_out: TriangleMultiplication::load(
                vb.pp("tri_mul_out"),
                c_z,
                c_hidden_tri_mul,
                TriangleDirection::Outgoing,
            )?,
            tri_mul_in: TriangleMultiplication::load(
                vb.pp("tri_mul_in"),
                c_z,
                c_hidden_tri_mul,
                TriangleDirection::Incoming,
            )?,
            tri_att_start: TriangleAttention::load(
                vb.pp("tri_att_start"),
                c_z,
                c_hidden_tri_att,
                num_heads_tri,
                inf,
                TriangleNode::Starting,
            )?,
            tri_att_end: TriangleAttention::load(
                vb.pp("tri_att_end"),
                c_z,
                c_hidden_tri_att,
                num_heads_tri,
                inf,
                TriangleNode::Ending,
            )?,
            pair_transition: Transition::load(vb.pp("pair_transition"), c_z, transition_n)?,
            ps_dropout_row: SharedDropout::rowwise(pair_dropout, fusion)?,
            ps_dropout_col: SharedDropout::columnwise(pair_dropout, fusion)?,
        })
    }

    /// Takes `m` column-sharded and `z` row-sharded and returns both
    /// row-sharded. The masks are the full, unsharded masks.
    ///
    /// The pair stack mixes every residue with every other one, so under DAP
    /// each rank assembles the full representations, runs the core on them and
    /// keeps its own row shard of the result.
    pub fn forward(
        &self,
        m: &Tensor,
        z: &Tensor,
        msa_mask: &Tensor,
        pair_mask: &Tensor,
        ctx: &dyn ParallelContext,
        mode: Mode,
    ) -> Result<(Tensor, Tensor)> {
        // Simplification: the pair stack runs unsharded on every rank, so DAP
        // saves no memory here. Results match a single process.
        let m = ctx.gather(m, 2)?;
        let z = ctx.gather(z, 1)?;

        let m = (&m + self.msa_transition.forward(&m, msa_mask)?)?;
        let z = (&z + self.outer_product_mean.forward(&m, msa_mask)?)?;

        let z = self.ps_dropout_row.forward(
            &self.tri_mul_out.forward(&z, pair_mask)?,
            &z,
            ctx,
            None,
            mode.fork(0),
        )?;
        let z = self.ps_dropout_row.forward(
            &self.tri_mul_in.forward(&z, pair_mask)?,
            &z,
            ctx,
            None,
            mode.fork(1),
        )?;
        let z = self.ps_dropout_row.forward(
            &self.tri_att_start.forward(&z, pair_mask)?,
            &z,
            ctx,
            None,
            mode.fork(2),
        )?;
        let z = self.ps_dropout_col.forward(
            &self.tri_att_end.forward(&z, pair_mask)?,
            &z,
            ctx,
            None,
            mode.fork(3),
        )?;
        let z = (&z + self.pair_transition.forward(&z, pair_mask)?)?;

        Ok((ctx.scatter(&m, 1)?, ctx.scatter(&z, 1)?))
    }
}
